use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::config::{PoolConfig, SqlDialect};
use crate::dispatch::ultimately_perform;
use crate::error::QueueError;
use crate::ops::job::{create_job, next_job, next_jobs};
use crate::types::{JobItem, NewJob};

/// A handle on the queue: a connection pool plus the locking dialect the
/// selection queries should use. Cheap to clone and share across tasks.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    dialect: SqlDialect,
}

impl JobQueue {
    pub async fn new(config: &PoolConfig, dialect: SqlDialect) -> Result<Self, QueueError> {
        let pool = config.connect().await?;
        Ok(Self { pool, dialect })
    }

    // Designed mostly to be used for testing, but safe enough to expose publicly
    pub fn from_pool(pool: PgPool, dialect: SqlDialect) -> Self {
        Self { pool, dialect }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Insert a job row on the caller's transaction, returning its id so the
    /// matching payload row can be inserted before the commit.
    pub async fn create_job(
        &self,
        conn: &mut PgConnection,
        new: &NewJob,
    ) -> Result<i64, QueueError> {
        create_job(conn, new).await
    }

    pub async fn next_job(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        min_priority: i32,
    ) -> Result<Option<JobItem>, QueueError> {
        next_job(conn, now, min_priority, self.dialect).await
    }

    pub async fn next_jobs(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        min_priority: i32,
        limit: usize,
    ) -> Result<Vec<JobItem>, QueueError> {
        next_jobs(conn, now, min_priority, limit, self.dialect).await
    }

    /// Run one job to completion with full accounting.
    pub async fn perform(&self, job_id: i64) -> Result<(), QueueError> {
        ultimately_perform(&self.pool, job_id).await
    }
}
