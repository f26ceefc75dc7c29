// Query functions for the job tables.
// Each function takes any executor so callers can run it on the pool or
// inside a transaction.

use sqlx::{Executor, QueryBuilder};
use uuid::Uuid;

use jobhub_queue::JobStatus;

use crate::DbBackend;

fn push_status_in<'a>(qb: &mut QueryBuilder<'a, DbBackend>, statuses: &[JobStatus]) {
    qb.push(" AND status IN (");
    let mut sep = qb.separated(", ");
    for status in statuses {
        sep.push_bind(status.as_str());
    }
    sep.push_unseparated(")");
}

pub mod jobs {
    use super::*;
    use crate::rows::{to_millis, JobFilter, JobRecord, JobRow};

    const COLUMNS: &str = "id, job_name, status, created_at, updated_at";

    pub async fn insert<'e, E>(executor: E, job: &JobRecord) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            "INSERT INTO jobs (id, job_name, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.id)
        .bind(&job.job_name)
        .bind(job.status.as_str())
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(executor)
        .await
        .map(|_| ())
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<JobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn list<'e, E>(executor: E, filter: &JobFilter) -> Result<Vec<JobRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        let mut qb = QueryBuilder::<DbBackend>::new(format!("SELECT {COLUMNS} FROM jobs"));
        if let Some(status) = filter.status {
            qb.push(" WHERE status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);
        qb.build_query_as::<JobRow>().fetch_all(executor).await
    }

    pub async fn count<'e, E>(executor: E, status: Option<JobStatus>) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        match status {
            Some(status) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(executor)
                    .await
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
                    .fetch_one(executor)
                    .await
            }
        }
    }

    /// Copy an instance status onto its job, but only while that instance is
    /// the job's latest one.
    pub async fn mirror_status<'e, E>(
        executor: E,
        job_id: Uuid,
        instance_id: Uuid,
        status: JobStatus,
        now: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, updated_at = ?
            WHERE id = ?
              AND ? = (SELECT id FROM job_instances WHERE job_id = ?
                       ORDER BY created_at DESC, rowid DESC LIMIT 1)
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(job_id)
        .bind(instance_id)
        .bind(job_id)
        .execute(executor)
        .await
        .map(|r| r.rows_affected())
    }
}

pub mod job_instances {
    use super::*;
    use crate::rows::{to_millis, InstanceRow, INSTANCE_COLUMNS};
    use jobhub_queue::JobInstance;

    /// Extra condition attached to a status transition.
    #[derive(Debug, Clone, Copy)]
    pub enum Guard {
        None,
        /// Only rows no worker has claimed.
        Unclaimed,
        /// Only rows whose lease expired before the given instant.
        LeaseExpiredBefore(i64),
    }

    pub async fn insert<'e, E>(executor: E, instance: &JobInstance) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            r#"
            INSERT INTO job_instances
                (id, job_id, job_name, args, status, progress, progress_text, log,
                 scheduled_at, created_at, updated_at, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.id)
        .bind(instance.job_id)
        .bind(&instance.job_name)
        .bind(&instance.args)
        .bind(instance.status.as_str())
        .bind(i64::from(instance.progress))
        .bind(&instance.progress_text)
        .bind(&instance.log)
        .bind(instance.scheduled_at.map(to_millis))
        .bind(to_millis(instance.created_at))
        .bind(to_millis(instance.updated_at))
        .bind(instance.started_at.map(to_millis))
        .bind(instance.finished_at.map(to_millis))
        .execute(executor)
        .await
        .map(|_| ())
    }

    pub async fn find_by_id<'e, E>(
        executor: E,
        id: Uuid,
    ) -> Result<Option<InstanceRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn current_for_job<'e, E>(
        executor: E,
        job_id: Uuid,
    ) -> Result<Option<InstanceRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE job_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn list_for_job<'e, E>(
        executor: E,
        job_id: Uuid,
    ) -> Result<Vec<InstanceRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE job_id = ? \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(job_id)
        .fetch_all(executor)
        .await
    }

    pub async fn status<'e, E>(executor: E, id: Uuid) -> Result<Option<String>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_scalar("SELECT status FROM job_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Status and lease owner, used to explain why a removal failed.
    pub async fn lease_state<'e, E>(
        executor: E,
        id: Uuid,
    ) -> Result<Option<(String, Option<String>)>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as("SELECT status, lease_owner FROM job_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Conditionally move an instance to `to`. Returns the job id when a row
    /// was updated.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition<'e, E>(
        executor: E,
        id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        log_line: Option<&str>,
        guard: Guard,
        now: i64,
    ) -> Result<Option<Uuid>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        if from.is_empty() {
            return Ok(None);
        }
        let mut qb = QueryBuilder::<DbBackend>::new("UPDATE job_instances SET status = ");
        qb.push_bind(to.as_str());
        qb.push(", updated_at = ").push_bind(now);
        if to == JobStatus::Running {
            qb.push(", started_at = ").push_bind(now);
        }
        if to.is_terminal() {
            qb.push(", finished_at = ")
                .push_bind(now)
                .push(", lease_expires_at = NULL");
        }
        if let Some(line) = log_line {
            qb.push(", log = CASE WHEN log = '' THEN ")
                .push_bind(line)
                .push(" ELSE log || char(10) || ")
                .push_bind(line)
                .push(" END");
        }
        qb.push(" WHERE id = ").push_bind(id);
        push_status_in(&mut qb, from);
        match guard {
            Guard::None => {}
            Guard::Unclaimed => {
                qb.push(" AND lease_owner IS NULL");
            }
            Guard::LeaseExpiredBefore(at) => {
                qb.push(" AND lease_expires_at < ").push_bind(at);
            }
        }
        qb.push(" RETURNING job_id");
        qb.build_query_scalar::<Uuid>()
            .fetch_optional(executor)
            .await
    }

    pub async fn append_log<'e, E>(
        executor: E,
        id: Uuid,
        line: &str,
        now: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            "UPDATE job_instances \
             SET log = CASE WHEN log = '' THEN ? ELSE log || char(10) || ? END, updated_at = ? \
             WHERE id = ?",
        )
        .bind(line)
        .bind(line)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await
        .map(|r| r.rows_affected())
    }

    pub async fn set_progress<'e, E>(
        executor: E,
        id: Uuid,
        percent: u8,
        now: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query("UPDATE job_instances SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(percent))
            .bind(now)
            .bind(id)
            .execute(executor)
            .await
            .map(|r| r.rows_affected())
    }

    pub async fn set_progress_text<'e, E>(
        executor: E,
        id: Uuid,
        markup: &str,
        now: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query("UPDATE job_instances SET progress_text = ?, updated_at = ? WHERE id = ?")
            .bind(markup)
            .bind(now)
            .bind(id)
            .execute(executor)
            .await
            .map(|r| r.rows_affected())
    }

    /// Claim the oldest due, unclaimed pending instance of one of `names`.
    pub async fn claim_next<'e, E>(
        executor: E,
        owner: &str,
        names: &[String],
        now: i64,
        lease_until: i64,
    ) -> Result<Option<InstanceRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        if names.is_empty() {
            return Ok(None);
        }
        let mut qb = QueryBuilder::<DbBackend>::new("UPDATE job_instances SET lease_owner = ");
        qb.push_bind(owner)
            .push(", lease_expires_at = ")
            .push_bind(lease_until)
            .push(
                " WHERE id = (SELECT id FROM job_instances \
                 WHERE status IN ('New', 'Scheduled') AND lease_owner IS NULL \
                 AND (scheduled_at IS NULL OR scheduled_at <= ",
            )
            .push_bind(now)
            .push(") AND job_name IN (");
        let mut sep = qb.separated(", ");
        for name in names {
            sep.push_bind(name.as_str());
        }
        sep.push_unseparated(
            ") ORDER BY COALESCE(scheduled_at, created_at), rowid LIMIT 1) \
             AND lease_owner IS NULL RETURNING ",
        );
        qb.push(INSTANCE_COLUMNS);
        qb.build_query_as::<InstanceRow>()
            .fetch_optional(executor)
            .await
    }

    /// Extend a lease held by `owner`. Returns the kill flag, or `None` when
    /// the lease is no longer held.
    pub async fn renew_lease<'e, E>(
        executor: E,
        id: Uuid,
        owner: &str,
        lease_until: i64,
    ) -> Result<Option<bool>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_scalar(
            "UPDATE job_instances SET lease_expires_at = ? \
             WHERE id = ? AND lease_owner = ? AND status IN ('New', 'Scheduled', 'Running') \
             RETURNING kill_requested",
        )
        .bind(lease_until)
        .bind(id)
        .bind(owner)
        .fetch_optional(executor)
        .await
    }

    pub async fn request_kill<'e, E>(executor: E, id: Uuid, now: i64) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            "UPDATE job_instances SET kill_requested = 1, updated_at = ? \
             WHERE id = ? AND status = 'Running'",
        )
        .bind(now)
        .bind(id)
        .execute(executor)
        .await
        .map(|r| r.rows_affected())
    }

    /// Hand claimed-but-never-started units back to the pool.
    pub async fn release_stale_claims<'e, E>(executor: E, now: i64) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query(
            "UPDATE job_instances SET lease_owner = NULL, lease_expires_at = NULL \
             WHERE status IN ('New', 'Scheduled') AND lease_owner IS NOT NULL \
             AND lease_expires_at < ?",
        )
        .bind(now)
        .execute(executor)
        .await
        .map(|r| r.rows_affected())
    }

    /// Every running instance, regardless of lease.
    pub async fn running<'e, E>(executor: E) -> Result<Vec<Uuid>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_scalar("SELECT id FROM job_instances WHERE status = 'Running'")
            .fetch_all(executor)
            .await
    }

    /// Pending instances, earliest due first.
    pub async fn pending<'e, E>(executor: E) -> Result<Vec<InstanceRow>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE status IN ('New', 'Scheduled') \
             ORDER BY COALESCE(scheduled_at, created_at), rowid"
        ))
        .fetch_all(executor)
        .await
    }

    pub async fn expired_running<'e, E>(executor: E, now: i64) -> Result<Vec<Uuid>, sqlx::Error>
    where
        E: Executor<'e, Database = DbBackend>,
    {
        sqlx::query_scalar(
            "SELECT id FROM job_instances WHERE status = 'Running' AND lease_expires_at < ?",
        )
        .bind(now)
        .fetch_all(executor)
        .await
    }
}
