use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;

use crate::config::SqlDialect;
use crate::error::QueueError;
use crate::types::{JobItem, NewJob};
use crate::work::work_type_for;
use crate::{FAILURE_RESCHEDULE_INTERVAL, LOCK_RESCHEDULE_INTERVAL};

/// Insert a job row, drawing its id from the sequence. The caller is expected
/// to insert the matching payload row in the same transaction.
pub async fn create_job(conn: &mut PgConnection, new: &NewJob) -> Result<i64, QueueError> {
    let job_id: i64 = sqlx::query_scalar(
        r#"
INSERT INTO job
    (work_type, priority, weight, not_before)
VALUES
    ($1, $2, $3, $4)
RETURNING job_id
        "#,
    )
    .bind(&new.work_type)
    .bind(new.priority)
    .bind(new.weight)
    .bind(new.not_before)
    .fetch_one(&mut *conn)
    .await?;

    Ok(job_id)
}

/// Load a job row without locking it. None means the job was already handled.
pub async fn load_job(conn: &mut PgConnection, job_id: i64) -> Result<Option<JobItem>, QueueError> {
    let job = sqlx::query_as::<_, JobItem>(
        r#"
SELECT job_id, work_type, priority, weight, not_before, assigned, overdue, failed, pause
FROM job
WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Find up to `limit` runnable jobs and lock their rows, without waiting on
/// contended rows so concurrent dispatchers spread out instead of serializing.
///
/// A job is runnable once its `not_before` has passed, it meets the priority
/// floor, it is not paused, and it is either unclaimed or claimed but past its
/// `overdue` deadline. Sorting `assigned` first (descending, nulls last) pulls
/// those overdue claims ahead of fresh work: repair beats progress. Ties go to
/// the higher priority.
pub async fn next_jobs(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    min_priority: i32,
    limit: usize,
    dialect: SqlDialect,
) -> Result<Vec<JobItem>, QueueError> {
    match dialect {
        SqlDialect::General => {
            let jobs = sqlx::query_as::<_, JobItem>(
                r#"
SELECT job_id, work_type, priority, weight, not_before, assigned, overdue, failed, pause
FROM job
WHERE
    not_before <= $1
    AND priority >= $2
    AND pause = 0
    AND (assigned IS NULL OR overdue < $1)
ORDER BY
    assigned DESC NULLS LAST,
    priority DESC
LIMIT $3
FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(now)
            .bind(min_priority)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?;

            Ok(jobs)
        }
        SqlDialect::Oracle => {
            // Engines in this dialect can't combine FOR UPDATE with ORDER BY,
            // so select the winners first and lock them by id afterwards.
            let mut jobs = sqlx::query_as::<_, JobItem>(
                r#"
SELECT job_id, work_type, priority, weight, not_before, assigned, overdue, failed, pause
FROM job
WHERE
    not_before <= $1
    AND priority >= $2
    AND pause = 0
    AND (assigned IS NULL OR overdue < $1)
ORDER BY
    assigned DESC NULLS LAST,
    priority DESC
LIMIT $3
                "#,
            )
            .bind(now)
            .bind(min_priority)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?;

            if jobs.is_empty() {
                return Ok(jobs);
            }

            let ids: Vec<i64> = jobs.iter().map(|job| job.job_id).collect();
            let locked: Vec<i64> = sqlx::query_scalar(
                "SELECT job_id FROM job WHERE job_id = ANY($1) FOR UPDATE SKIP LOCKED",
            )
            .bind(&ids)
            .fetch_all(&mut *conn)
            .await?;

            // Rows that vanished or got locked between the two statements went
            // to another dispatcher. Drop them silently.
            let locked: HashSet<i64> = locked.into_iter().collect();
            jobs.retain(|job| locked.contains(&job.job_id));

            Ok(jobs)
        }
    }
}

/// `next_jobs` with a limit of one. More than one row back is a programming
/// error and crashes rather than silently double-claiming.
pub async fn next_job(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    min_priority: i32,
    dialect: SqlDialect,
) -> Result<Option<JobItem>, QueueError> {
    let jobs = next_jobs(conn, now, min_priority, 1, dialect).await?;

    if jobs.len() > 1 {
        panic!("next_job returned more than one row");
    }

    Ok(jobs.into_iter().next())
}

impl JobItem {
    /// Claim this job: stamp `assigned` and give the claim a deadline of
    /// `overdue_seconds` from the claim time.
    pub async fn assign(
        &mut self,
        conn: &mut PgConnection,
        when: DateTime<Utc>,
        overdue_seconds: i64,
    ) -> Result<(), QueueError> {
        let overdue = when + Duration::seconds(overdue_seconds);

        sqlx::query("UPDATE job SET assigned = $1, overdue = $2 WHERE job_id = $3")
            .bind(when)
            .bind(overdue)
            .bind(self.job_id)
            .execute(&mut *conn)
            .await?;

        self.assigned = Some(when);
        self.overdue = Some(overdue);
        Ok(())
    }

    /// Push the claim deadline out by `bump_seconds`. Used when overdue
    /// detection finds the payload still locked, meaning the job is genuinely
    /// still running somewhere.
    pub async fn bump_overdue(
        &mut self,
        conn: &mut PgConnection,
        bump_seconds: i64,
    ) -> Result<(), QueueError> {
        let Some(overdue) = self.overdue else {
            return Ok(());
        };
        let overdue = overdue + Duration::seconds(bump_seconds);

        sqlx::query("UPDATE job SET overdue = $1 WHERE job_id = $2")
            .bind(overdue)
            .bind(self.job_id)
            .execute(&mut *conn)
            .await?;

        self.overdue = Some(overdue);
        Ok(())
    }

    /// The attempt to run this job failed. Leave it in the queue but
    /// unclaimed, and push `not_before` into the future.
    ///
    /// `locked` means the failure was a payload lock conflict rather than a
    /// real failure, so the failure count is left alone. Without an explicit
    /// `delay` the reschedule interval scales linearly with the failure count.
    pub async fn failed_to_run(
        &mut self,
        conn: &mut PgConnection,
        locked: bool,
        delay: Option<i64>,
    ) -> Result<(), QueueError> {
        let delay = delay.unwrap_or_else(|| {
            let base = if locked {
                LOCK_RESCHEDULE_INTERVAL
            } else {
                FAILURE_RESCHEDULE_INTERVAL
            };
            base * (self.failed as i64 + 1)
        });
        let failed = self.failed + if locked { 0 } else { 1 };
        let not_before = Utc::now() + Duration::seconds(delay);

        sqlx::query(
            r#"
UPDATE job
SET assigned = NULL, overdue = NULL, failed = $1, not_before = $2
WHERE job_id = $3
            "#,
        )
        .bind(failed)
        .bind(not_before)
        .bind(self.job_id)
        .execute(&mut *conn)
        .await?;

        self.assigned = None;
        self.overdue = None;
        self.failed = failed;
        self.not_before = not_before;
        Ok(())
    }

    /// Set or clear the pause flag, leaving everything else alone. Paused
    /// jobs are skipped by selection until unpaused.
    pub async fn pause_it(&mut self, conn: &mut PgConnection, pause: bool) -> Result<(), QueueError> {
        let value: i32 = if pause { 1 } else { 0 };

        sqlx::query("UPDATE job SET pause = $1 WHERE job_id = $2")
            .bind(value)
            .bind(self.job_id)
            .execute(&mut *conn)
            .await?;

        self.pause = value;
        Ok(())
    }

    /// Remove the job row. Returns false if it was already gone, which the
    /// success path treats as fine: someone else finished the clean up.
    pub async fn delete(&self, conn: &mut PgConnection) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM job WHERE job_id = $1")
            .bind(self.job_id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether the payload row is currently locked by some worker. Note that
    /// probing a free row takes its lock until the transaction ends.
    pub async fn is_running(&self, conn: &mut PgConnection) -> Result<bool, QueueError> {
        let source = work_type_for(&self.work_type)?;
        let mut items = source.load_for_job(conn, self.job_id).await?;
        if items.len() != 1 {
            return Ok(false);
        }
        let Some(mut work) = items.pop() else {
            return Ok(false);
        };

        Ok(!work.trylock(conn).await?)
    }
}
