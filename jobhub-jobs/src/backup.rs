//! The `backup.create` job.

use std::time::Duration;

use jobhub_engine::{JobArgs, JobContext, JobType, RawArgs, RegistryError, ValidationErrors};
use jobhub_queue::JobQueueError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::job_types;

pub const MAX_STEPS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Arguments of a `backup.create` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCreate {
    pub kind: BackupKind,
    /// Number of chunks the backup is written in.
    pub steps: i64,
}

impl JobArgs for BackupCreate {
    fn validate(&self) -> Result<(), ValidationErrors> {
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return Err(ValidationErrors::single(
                "steps",
                "out_of_range",
                format!("steps must be between 1 and {MAX_STEPS}"),
            ));
        }
        Ok(())
    }
}

pub fn parse(raw: &RawArgs) -> Result<BackupCreate, ValidationErrors> {
    let kind = match raw.optional_str("kind").as_deref() {
        None | Some("full") => Some(BackupKind::Full),
        Some("incremental") => Some(BackupKind::Incremental),
        Some(other) => {
            raw.invalid(
                "kind",
                "invalid_choice",
                format!("kind must be full or incremental, not {other}"),
            );
            None
        }
    };
    let steps = raw.required_i64_in("steps", 1, MAX_STEPS);
    raw.finish(kind.zip(steps).map(|(kind, steps)| BackupCreate { kind, steps }))
}

/// Write the backup chunk by chunk, stopping as soon as the job is aborted.
pub async fn run(ctx: JobContext<BackupCreate>, chunk_delay: Duration) -> Result<(), JobQueueError> {
    let BackupCreate { kind, steps } = ctx.args;
    ctx.append_log(format!("starting {} backup in {steps} chunks", kind.as_str()))
        .await?;

    for chunk in 1..=steps {
        tokio::select! {
            _ = ctx.cancelled() => {
                ctx.append_log(format!("stopped after {} of {steps} chunks", chunk - 1))
                    .await?;
                return Err(JobQueueError::Interrupted);
            }
            _ = tokio::time::sleep(chunk_delay) => {}
        }
        ctx.set_progress(chunk * 100 / steps).await?;
        ctx.set_progress_text(format!("<p>chunk {chunk} of {steps}</p>"))
            .await?;
    }

    ctx.append_log("backup complete").await?;
    info!(job_id = %ctx.job_id(), kind = kind.as_str(), steps, "backup created");
    Ok(())
}

pub fn job_type(chunk_delay: Duration) -> Result<JobType, RegistryError> {
    JobType::builder(job_types::BACKUP_CREATE)
        .description("Create a database backup")
        .resource("backups")
        .parser(parse)
        .handler(move |ctx: JobContext<BackupCreate>| run(ctx, chunk_delay))
        .build()
}
