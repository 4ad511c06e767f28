use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::time::{sleep, Instant};

use crate::error::QueueError;
use crate::work::WorkType;

// Tests poll at this interval while waiting for the queue to settle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait for the job table to drain completely. Returns false once `timeout`
/// elapses with jobs still present. Only use this in tests that need to wait
/// for results from jobs.
pub async fn wait_empty(pool: &PgPool, timeout: Duration) -> Result<bool, QueueError> {
    let deadline = Instant::now() + timeout;

    loop {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job")
            .fetch_one(pool)
            .await?;
        if count == 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait for one specific job to complete, i.e. for its row to disappear.
pub async fn wait_job_done(
    pool: &PgPool,
    timeout: Duration,
    job_id: i64,
) -> Result<bool, QueueError> {
    let deadline = Instant::now() + timeout;

    loop {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(pool)
            .await?;
        if count == 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait until none of the given work types has payload rows left.
pub async fn wait_work_done(
    pool: &PgPool,
    timeout: Duration,
    work_types: &[Arc<dyn WorkType>],
) -> Result<bool, QueueError> {
    let deadline = Instant::now() + timeout;

    loop {
        let mut total = 0;
        let mut conn = pool.acquire().await?;
        for work_type in work_types {
            total += work_type.count(conn.as_mut()).await?;
        }
        drop(conn);

        if total == 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(POLL_INTERVAL).await;
    }
}
