//! Core types for the job queue system.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobQueueError;

/// Interval at which observers re-poll a job that is still in flight.
pub const PROGRESS_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Status of a job and of its instances.
///
/// The serialized names are the literal strings other layers match on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    New,
    Scheduled,
    Running,
    Cancelled,
    Done,
    Exception,
    Killed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::New,
        Self::Scheduled,
        Self::Running,
        Self::Cancelled,
        Self::Done,
        Self::Exception,
        Self::Killed,
    ];

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Cancelled => "Cancelled",
            Self::Done => "Done",
            Self::Exception => "Exception",
            Self::Killed => "Killed",
        }
    }

    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Done | Self::Exception | Self::Killed
        )
    }

    /// New and Scheduled units have not started executing yet.
    #[inline]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::New | Self::Scheduled)
    }

    #[inline]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobQueueError::UnknownStatus(s.to_owned()))
    }
}

/// One execution attempt of a job.
///
/// The queue keys units by `job_id`; `id` identifies the attempt itself so
/// reruns and updates leave the earlier attempts behind as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub args: String,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_text: String,
    pub log: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    /// Create a new instance in status `New`.
    pub fn new(job_id: Uuid, job_name: impl Into<String>, args: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            job_name: job_name.into(),
            args: args.into(),
            status: JobStatus::New,
            progress: 0,
            progress_text: String::new(),
            log: String::new(),
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Defer execution until `at`. A time in the future turns the instance
    /// into `Scheduled`; a past or present time leaves it `New`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        if at > self.created_at {
            self.status = JobStatus::Scheduled;
        }
        self
    }

    /// Whether the unit may be dequeued at `now`.
    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            status: self.status,
            progress: self.progress,
            progress_text: self.progress_text.clone(),
            log: self.log.clone(),
        }
    }
}

/// Snapshot returned to polling observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub status: JobStatus,
    pub progress: u8,
    pub progress_text: String,
    pub log: String,
}

impl JobProgress {
    /// Observers keep polling only while the job is New or Running.
    #[inline]
    pub fn should_poll(&self) -> bool {
        matches!(self.status, JobStatus::New | JobStatus::Running)
    }

    /// Delay before the next poll; zero means polling stops.
    #[inline]
    pub fn refresh_interval(&self) -> Duration {
        if self.should_poll() {
            PROGRESS_REFRESH_INTERVAL
        } else {
            Duration::ZERO
        }
    }
}

/// Clip a requested percentage into the [0, 100] range.
#[inline]
pub fn clip_progress(percent: i64) -> u8 {
    percent.clamp(0, 100) as u8
}
