use std::sync::Arc;

use jobhub_engine::JobEngine;

/// Shared application state passed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
}

impl AppState {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self { engine }
    }
}
