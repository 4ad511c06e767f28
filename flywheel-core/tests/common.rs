use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flywheel_core::{
    create_job, register_work_type, JobItem, NewJob, QueueError, WorkError, WorkItem, WorkType,
};
use sqlx::{PgConnection, PgPool};

pub const TEST_WORK_TABLE: &str = "test_work";

/// A payload type whose behavior is driven by its `mode` column, so tests can
/// exercise every dispatch outcome. Successful runs append to `test_work_log`,
/// which lets tests count how many times `do_work` actually happened.
#[derive(Debug, sqlx::FromRow)]
pub struct TestWork {
    pub work_id: i64,
    pub job_id: i64,
    pub mode: String,
}

#[async_trait]
impl WorkItem for TestWork {
    fn work_table(&self) -> &'static str {
        TEST_WORK_TABLE
    }

    fn work_id(&self) -> i64 {
        self.work_id
    }

    fn job_id(&self) -> i64 {
        self.job_id
    }

    async fn before_work(&mut self, conn: &mut PgConnection) -> Result<bool, WorkError> {
        // Delete our row up front the way real payloads do. A row someone
        // else already finished, or a "skip" instruction, vetoes the rest.
        let result = sqlx::query("DELETE FROM test_work WHERE work_id = $1")
            .bind(self.work_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0 && self.mode != "skip")
    }

    async fn do_work(&mut self, conn: &mut PgConnection) -> Result<(), WorkError> {
        match self.mode.as_str() {
            "ok" => {
                sqlx::query("INSERT INTO test_work_log (job_id) VALUES ($1)")
                    .bind(self.job_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            "temporary" => Err(WorkError::temporary(5)),
            "fail" => Err(WorkError::failure("instructed to fail")),
            other => Err(WorkError::failure(format!("unknown test mode {other}"))),
        }
    }
}

pub struct TestWorkType;

#[async_trait]
impl WorkType for TestWorkType {
    fn work_type(&self) -> &'static str {
        TEST_WORK_TABLE
    }

    async fn load_for_job(
        &self,
        conn: &mut PgConnection,
        job_id: i64,
    ) -> Result<Vec<Box<dyn WorkItem>>, QueueError> {
        let rows: Vec<TestWork> =
            sqlx::query_as("SELECT work_id, job_id, mode FROM test_work WHERE job_id = $1")
                .bind(job_id)
                .fetch_all(&mut *conn)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| -> Box<dyn WorkItem> { Box::new(row) })
            .collect())
    }
}

/// Create the payload tables and make sure the work type is registered. The
/// registry is process wide, so registration has to be idempotent here.
#[allow(dead_code)]
pub async fn setup_test_work(db: &PgPool) {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS test_work (
    work_id BIGSERIAL PRIMARY KEY,
    job_id BIGINT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'ok'
)
        "#,
    )
    .execute(db)
    .await
    .expect("failed to create test work table");

    sqlx::query("CREATE TABLE IF NOT EXISTS test_work_log (job_id BIGINT NOT NULL)")
        .execute(db)
        .await
        .expect("failed to create test work log");

    register_work_type(Arc::new(TestWorkType));
}

/// Enqueue a job and its payload row in one transaction, like a real producer.
#[allow(dead_code)]
pub async fn enqueue_test_work(db: &PgPool, mode: &str, new: &NewJob) -> i64 {
    let mut txn = db.begin().await.expect("failed to begin");
    let job_id = create_job(&mut txn, new)
        .await
        .expect("failed to create job");
    sqlx::query("INSERT INTO test_work (job_id, mode) VALUES ($1, $2)")
        .bind(job_id)
        .bind(mode)
        .execute(&mut *txn)
        .await
        .expect("failed to insert work row");
    txn.commit().await.expect("failed to commit");

    job_id
}

/// A job that became runnable a minute ago.
#[allow(dead_code)]
pub fn runnable_job() -> NewJob {
    NewJob::new(TEST_WORK_TABLE, Utc::now() - Duration::minutes(1))
}

#[allow(dead_code)]
pub async fn fetch_job(db: &PgPool, job_id: i64) -> Option<JobItem> {
    let mut conn = db.acquire().await.expect("failed to acquire connection");
    flywheel_core::load_job(conn.as_mut(), job_id)
        .await
        .expect("failed to load job")
}

#[allow(dead_code)]
pub async fn work_row_count(db: &PgPool, job_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM test_work WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(db)
        .await
        .expect("failed to count work rows")
}

#[allow(dead_code)]
pub async fn execution_count(db: &PgPool, job_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM test_work_log WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(db)
        .await
        .expect("failed to count executions")
}

/// Roundtripping a datetime to PG can cause sub-ms differences, so timestamps
/// are compared within a margin of error.
#[allow(dead_code)]
pub fn dates_match(left: &DateTime<Utc>, right: &DateTime<Utc>) -> bool {
    (*left - *right).abs() < Duration::milliseconds(1)
}

/// Check that a timestamp landed `seconds` in the future of `from`, within a
/// generous margin for test scheduling delays.
#[allow(dead_code)]
pub fn lands_about(actual: &DateTime<Utc>, from: &DateTime<Utc>, seconds: i64) -> bool {
    let offset = *actual - *from;
    offset >= Duration::seconds(seconds - 1) && offset <= Duration::seconds(seconds + 5)
}
