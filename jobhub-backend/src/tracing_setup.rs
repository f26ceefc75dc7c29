use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level.
fn env_filter(cfg: &jobhub_config::LoggingConfig) -> EnvFilter {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());
    EnvFilter::try_new(&directives).unwrap_or_else(|error| {
        eprintln!("[STARTUP] invalid log filter `{directives}` ({error}), using info");
        EnvFilter::new("info")
    })
}

/// Initialize tracing from configuration.
///
/// Fails only when a global subscriber is already installed.
pub fn install_tracing_from_config(cfg: &jobhub_config::LoggingConfig) -> Result<(), String> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(cfg))
        .with_timer(ChronoUtc::rfc_3339())
        .with_target(true);

    let result = if cfg.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| format!("tracing init failed: {e}"))
}
