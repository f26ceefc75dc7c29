//! Execution callback shared by every queue backend.

use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::JobQueueError;
use crate::executor::JobExecutor;
use crate::handle::JobHandle;
use crate::reporter::ProgressReporter;
use crate::types::JobStatus;

/// Log line appended when a unit ends because of an abort.
pub const KILLED_LOG_LINE: &str = "job killed";

const PENDING: [JobStatus; 2] = [JobStatus::New, JobStatus::Scheduled];

/// Run one dequeued unit to completion.
///
/// Returns the terminal status that was written, or `None` when the unit was
/// skipped because it was no longer pending (cancelled between dequeue and
/// start) or another writer got to it first. A unit whose token is already
/// cancelled at start becomes `Cancelled` without running.
pub async fn execute_unit(
    handle: Arc<dyn JobHandle>,
    executor: Arc<dyn JobExecutor>,
    interrupt: CancellationToken,
) -> Result<Option<JobStatus>, JobQueueError> {
    let instance = handle.instance();
    let job_id = instance.job_id;
    let job_name = instance.job_name.clone();

    let status = handle.status().await?;
    if !status.is_pending() {
        debug!(%job_id, %job_name, %status, "skipping unit that is no longer pending");
        return Ok(None);
    }
    if interrupt.is_cancelled() {
        // Killed between dispatch and start: the handler never runs.
        if !handle.transition(&PENDING, JobStatus::Cancelled, None).await? {
            return Ok(None);
        }
        info!(%job_id, %job_name, "job cancelled before start");
        return Ok(Some(JobStatus::Cancelled));
    }
    if !handle.transition(&PENDING, JobStatus::Running, None).await? {
        debug!(%job_id, %job_name, "unit was claimed by another writer before start");
        return Ok(None);
    }
    info!(%job_id, %job_name, instance_id = %instance.id, "job started");

    let reporter = ProgressReporter::new(Arc::clone(&handle), interrupt.clone());
    let outcome = tokio::spawn(async move { executor.execute(reporter).await }).await;

    let (final_status, log_line) = classify(outcome, interrupt.is_cancelled());
    match final_status {
        JobStatus::Done => info!(%job_id, %job_name, "job finished"),
        JobStatus::Killed => info!(%job_id, %job_name, "job killed"),
        _ => warn!(
            %job_id,
            %job_name,
            error = log_line.as_deref().unwrap_or_default(),
            "job failed"
        ),
    }

    match handle
        .transition(&[JobStatus::Running], final_status, log_line.as_deref())
        .await
    {
        Ok(true) => Ok(Some(final_status)),
        Ok(false) => {
            // Someone else (the lease reaper) already finalized the instance.
            warn!(%job_id, %job_name, status = %final_status, "final transition lost");
            Ok(None)
        }
        Err(e) => {
            error!(%job_id, %job_name, error = %e, "failed to persist final job status");
            Err(e)
        }
    }
}

fn classify(
    outcome: Result<Result<(), JobQueueError>, JoinError>,
    cancelled: bool,
) -> (JobStatus, Option<String>) {
    match outcome {
        Ok(Ok(())) if !cancelled => (JobStatus::Done, None),
        Ok(Ok(())) | Ok(Err(JobQueueError::Interrupted)) => {
            (JobStatus::Killed, Some(KILLED_LOG_LINE.to_owned()))
        }
        Ok(Err(_)) if cancelled => (JobStatus::Killed, Some(KILLED_LOG_LINE.to_owned())),
        Ok(Err(e)) => (JobStatus::Exception, Some(e.to_string())),
        Err(join) if join.is_panic() => (
            JobStatus::Exception,
            Some(format!("job panicked: {}", panic_message(join.into_panic()))),
        ),
        Err(_) => (JobStatus::Killed, Some(KILLED_LOG_LINE.to_owned())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
