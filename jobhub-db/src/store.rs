//! The job record store.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use jobhub_queue::{JobInstance, JobProgress, JobStatus};

use crate::error::StoreError;
use crate::queries::job_instances::{self, Guard};
use crate::queries::jobs;
use crate::rows::{to_millis, JobFilter, JobRecord};
use crate::{DbBackend, DbPool};

/// Log line appended when the reaper gives up on a silent worker.
pub const LEASE_EXPIRED_LOG_LINE: &str = "worker lease expired";

/// Log line appended to instances a previous process left running.
pub const WORKER_LOST_LOG_LINE: &str = "worker lost before completion";

const PENDING: [JobStatus; 2] = [JobStatus::New, JobStatus::Scheduled];

/// Durable storage for jobs and their instances.
///
/// Records are never deleted. All status writes are conditional on the
/// current status so a late writer cannot regress what an observer saw.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Cheap connectivity probe for readiness checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, DbBackend>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a job row. Runs on the caller's connection, normally a transaction.
    pub async fn insert_job(conn: &mut SqliteConnection, job: &JobRecord) -> Result<(), StoreError> {
        jobs::insert(conn, job).await?;
        Ok(())
    }

    /// Insert an instance and point its job's status at it.
    pub async fn insert_instance(
        conn: &mut SqliteConnection,
        instance: &JobInstance,
    ) -> Result<(), StoreError> {
        job_instances::insert(&mut *conn, instance)
            .await
            .map_err(|e| StoreError::from_insert(e, instance.job_id))?;
        jobs::mirror_status(
            &mut *conn,
            instance.job_id,
            instance.id,
            instance.status,
            to_millis(instance.updated_at),
        )
        .await?;
        Ok(())
    }

    pub async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        jobs::find_by_id(&self.pool, id)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    pub async fn find_instance(&self, id: Uuid) -> Result<Option<JobInstance>, StoreError> {
        job_instances::find_by_id(&self.pool, id)
            .await?
            .map(JobInstance::try_from)
            .transpose()
    }

    /// The latest instance of a job.
    pub async fn current_instance(&self, job_id: Uuid) -> Result<Option<JobInstance>, StoreError> {
        job_instances::current_for_job(&self.pool, job_id)
            .await?
            .map(JobInstance::try_from)
            .transpose()
    }

    /// Every instance of a job, oldest first.
    pub async fn list_instances(&self, job_id: Uuid) -> Result<Vec<JobInstance>, StoreError> {
        job_instances::list_for_job(&self.pool, job_id)
            .await?
            .into_iter()
            .map(JobInstance::try_from)
            .collect()
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        jobs::list(&self.pool, filter)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }

    pub async fn count_jobs(&self, status: Option<JobStatus>) -> Result<i64, StoreError> {
        Ok(jobs::count(&self.pool, status).await?)
    }

    /// Read-only progress snapshot of a job's current instance.
    pub async fn progress(&self, job_id: Uuid) -> Result<Option<JobProgress>, StoreError> {
        Ok(self.current_instance(job_id).await?.map(|i| i.progress()))
    }

    pub async fn instance_status(&self, id: Uuid) -> Result<JobStatus, StoreError> {
        let raw = job_instances::status(&self.pool, id)
            .await?
            .ok_or(StoreError::InstanceNotFound(id))?;
        crate::rows::parse_status(&raw)
    }

    /// Move an instance from one of `from` to `to`, mirroring the status into
    /// the job row. Returns whether a row changed.
    pub async fn transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.guarded_transition(id, from, to, log_line, Guard::None)
            .await
    }

    async fn guarded_transition(
        &self,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
        guard: Guard,
    ) -> Result<bool, StoreError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        let Some(job_id) =
            job_instances::transition(&mut *tx, id, from, to, log_line, guard, now).await?
        else {
            return Ok(false);
        };
        jobs::mirror_status(&mut *tx, job_id, id, to, now).await?;
        tx.commit().await?;
        debug!(%job_id, instance_id = %id, status = %to, "job status changed");
        Ok(true)
    }

    pub async fn append_log(&self, id: Uuid, line: &str) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        match job_instances::append_log(&self.pool, id, line, now).await? {
            0 => Err(StoreError::InstanceNotFound(id)),
            _ => Ok(()),
        }
    }

    pub async fn set_progress(&self, id: Uuid, percent: u8) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        match job_instances::set_progress(&self.pool, id, percent.min(100), now).await? {
            0 => Err(StoreError::InstanceNotFound(id)),
            _ => Ok(()),
        }
    }

    pub async fn set_progress_text(&self, id: Uuid, markup: &str) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        match job_instances::set_progress_text(&self.pool, id, markup, now).await? {
            0 => Err(StoreError::InstanceNotFound(id)),
            _ => Ok(()),
        }
    }

    // Lease operations used by the durable queue.

    pub async fn claim_next(
        &self,
        owner: &str,
        names: &[String],
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobInstance>, StoreError> {
        job_instances::claim_next(
            &self.pool,
            owner,
            names,
            to_millis(now),
            to_millis(lease_until),
        )
        .await?
        .map(JobInstance::try_from)
        .transpose()
    }

    pub async fn renew_lease(
        &self,
        id: Uuid,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<bool>, StoreError> {
        Ok(job_instances::renew_lease(&self.pool, id, owner, to_millis(lease_until)).await?)
    }

    /// Persist a kill request for a running instance.
    pub async fn request_kill(&self, id: Uuid) -> Result<bool, StoreError> {
        let now = to_millis(Utc::now());
        Ok(job_instances::request_kill(&self.pool, id, now).await? > 0)
    }

    /// Cancel a pending instance no worker has claimed yet.
    pub async fn cancel_unclaimed(&self, id: Uuid) -> Result<bool, StoreError> {
        self.guarded_transition(id, &PENDING, JobStatus::Cancelled, None, Guard::Unclaimed)
            .await
    }

    /// Status and lease owner of an instance.
    pub async fn lease_state(
        &self,
        id: Uuid,
    ) -> Result<Option<(JobStatus, Option<String>)>, StoreError> {
        match job_instances::lease_state(&self.pool, id).await? {
            Some((status, owner)) => Ok(Some((crate::rows::parse_status(&status)?, owner))),
            None => Ok(None),
        }
    }

    /// Recover from dead workers: running instances whose lease expired become
    /// `Exception`, and stale claims on pending instances are released.
    ///
    /// Returns `(expired, released)`.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<(u64, u64), StoreError> {
        let now = to_millis(now);
        let mut expired = 0;
        for id in job_instances::expired_running(&self.pool, now).await? {
            if self
                .guarded_transition(
                    id,
                    &[JobStatus::Running],
                    JobStatus::Exception,
                    Some(LEASE_EXPIRED_LOG_LINE),
                    Guard::LeaseExpiredBefore(now),
                )
                .await?
            {
                expired += 1;
            }
        }
        let released = job_instances::release_stale_claims(&self.pool, now).await?;
        if expired > 0 || released > 0 {
            info!(expired, released, "reaped expired job leases");
        }
        Ok((expired, released))
    }

    /// Fail every running instance, lease or not. Only sound when no other
    /// process executes units against this database.
    pub async fn fail_running(&self, log_line: &str) -> Result<u64, StoreError> {
        let mut failed = 0;
        for id in job_instances::running(&self.pool).await? {
            if self
                .transition(id, &[JobStatus::Running], JobStatus::Exception, Some(log_line))
                .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Every `New` or `Scheduled` instance, earliest due first.
    pub async fn pending_instances(&self) -> Result<Vec<JobInstance>, StoreError> {
        job_instances::pending(&self.pool)
            .await?
            .into_iter()
            .map(JobInstance::try_from)
            .collect()
    }
}
