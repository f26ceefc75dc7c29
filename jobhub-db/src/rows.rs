//! Row types as stored in SQLite and their conversions to domain types.
//!
//! Timestamps are unix milliseconds, statuses their literal names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobhub_queue::{JobInstance, JobStatus};

use crate::error::StoreError;

/// The durable record of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A job record mirroring its first instance.
    pub fn for_instance(instance: &JobInstance) -> Self {
        Self {
            id: instance.job_id,
            job_name: instance.job_name.clone(),
            status: instance.status,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Filter for listing jobs, newest first.
#[derive(Debug, Clone, Copy)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub job_name: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            status: parse_status(&row.status)?,
            job_name: row.job_name,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

pub(crate) const INSTANCE_COLUMNS: &str = "id, job_id, job_name, args, status, progress, \
     progress_text, log, scheduled_at, created_at, updated_at, started_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub args: String,
    pub status: String,
    pub progress: i64,
    pub progress_text: String,
    pub log: String,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TryFrom<InstanceRow> for JobInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            status: parse_status(&row.status)?,
            job_name: row.job_name,
            args: row.args,
            progress: jobhub_queue::clip_progress(row.progress),
            progress_text: row.progress_text,
            log: row.log,
            scheduled_at: row.scheduled_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            started_at: row.started_at.map(from_millis).transpose()?,
            finished_at: row.finished_at.map(from_millis).transpose()?,
        })
    }
}

pub(crate) fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown status `{raw}`")))
}

#[inline]
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_roundtrip_truncates_to_millis() {
        let now = Utc::now();
        let back = from_millis(to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn unknown_status_is_corrupt() {
        assert!(matches!(parse_status("Paused"), Err(StoreError::Corrupt(_))));
        assert_eq!(parse_status("Done").unwrap(), JobStatus::Done);
    }

    #[test]
    fn instance_row_converts() {
        let row = InstanceRow {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_name: "SendEmail".into(),
            args: "{}".into(),
            status: "Running".into(),
            progress: 250,
            progress_text: String::new(),
            log: "a\nb".into(),
            scheduled_at: None,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_500,
            started_at: Some(1_700_000_000_100),
            finished_at: None,
        };
        let inst = JobInstance::try_from(row).unwrap();
        assert_eq!(inst.status, JobStatus::Running);
        assert_eq!(inst.progress, 100);
        assert_eq!(inst.started_at.unwrap().timestamp_millis(), 1_700_000_000_100);
    }
}
