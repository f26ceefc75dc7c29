//! Handler-facing progress reporting.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::handle::JobHandle;
use crate::types::clip_progress;

/// Reports log lines and progress for the instance a handler is executing.
///
/// Writes go straight through the [`JobHandle`] and are durable once the
/// returned future resolves.
#[derive(Clone)]
pub struct ProgressReporter {
    handle: Arc<dyn JobHandle>,
    interrupt: CancellationToken,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instance = self.handle.instance();
        f.debug_struct("ProgressReporter")
            .field("job_id", &instance.job_id)
            .field("instance_id", &instance.id)
            .field("interrupted", &self.interrupt.is_cancelled())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(handle: Arc<dyn JobHandle>, interrupt: CancellationToken) -> Self {
        Self { handle, interrupt }
    }

    #[inline]
    pub fn job_id(&self) -> Uuid {
        self.handle.instance().job_id
    }

    #[inline]
    pub fn instance_id(&self) -> Uuid {
        self.handle.instance().id
    }

    #[inline]
    pub fn job_name(&self) -> &str {
        &self.handle.instance().job_name
    }

    /// Serialized arguments of the instance.
    #[inline]
    pub fn args(&self) -> &str {
        &self.handle.instance().args
    }

    /// Append one line to the instance log.
    pub async fn append_log(&self, line: impl AsRef<str>) -> Result<(), JobQueueError> {
        self.handle.append_log(line.as_ref()).await
    }

    /// Set the completion percentage, clipped to [0, 100].
    pub async fn set_progress(&self, percent: i64) -> Result<(), JobQueueError> {
        self.handle.set_progress(clip_progress(percent)).await
    }

    /// Replace the supplementary block shown to observers.
    pub async fn set_progress_text(&self, markup: impl AsRef<str>) -> Result<(), JobQueueError> {
        self.handle.set_progress_text(markup.as_ref()).await
    }

    /// True once an abort or kill has been requested for this unit.
    ///
    /// Long loops should poll this and return [`JobQueueError::Interrupted`].
    #[inline]
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Resolves when the unit is interrupted; handy inside `tokio::select!`.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.interrupt.cancelled()
    }

    /// Convenience for handlers: error out if interrupted.
    #[inline]
    pub fn check_interrupted(&self) -> Result<(), JobQueueError> {
        if self.interrupted() {
            Err(JobQueueError::Interrupted)
        } else {
            Ok(())
        }
    }
}
