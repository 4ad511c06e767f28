use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use sqlx::PgConnection;

use crate::error::{QueueError, WorkError};

/// Take a non-waiting exclusive lock on the payload row for `job_id` in
/// `table`, returning false if another transaction already holds it. The lock
/// is held until the surrounding transaction ends.
///
/// SKIP LOCKED rather than NOWAIT: a NOWAIT conflict is a statement error,
/// which would poison the surrounding transaction. A skipped row and an absent
/// row both come back empty, so a plain read disambiguates the two.
pub async fn lock_work_row(
    conn: &mut PgConnection,
    table: &str,
    job_id: i64,
) -> Result<bool, QueueError> {
    let lock_query = format!(
        r#"SELECT work_id FROM "{}" WHERE job_id = $1 FOR UPDATE SKIP LOCKED"#,
        table
    );
    let locked = sqlx::query(&lock_query)
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    if locked.is_some() {
        return Ok(true);
    }

    let exists_query = format!(r#"SELECT work_id FROM "{}" WHERE job_id = $1"#, table);
    let exists = sqlx::query(&exists_query)
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;

    // No row at all means there was nothing to contend on
    Ok(exists.is_none())
}

/// One loaded payload row, the thing a job actually does when it runs.
///
/// Execution happens in three phases, `before_work`, `do_work` and
/// `after_work`, all on the same transaction and aborting on first failure.
/// `before_work` may veto the remaining phases by returning false. The default
/// `before_work` deletes the payload row so a successfully finished job leaves
/// nothing behind; implementations that keep their row must arrange their own
/// cleanup.
#[async_trait]
pub trait WorkItem: Send {
    /// The table this payload row lives in.
    fn work_table(&self) -> &'static str;

    fn work_id(&self) -> i64;

    fn job_id(&self) -> i64;

    /// The exclusive lock taken before execution. Returning false means some
    /// other process is running this job right now.
    async fn runlock(&mut self, conn: &mut PgConnection) -> Result<bool, QueueError> {
        lock_work_row(conn, self.work_table(), self.job_id()).await
    }

    /// Non-blocking probe used by overdue detection. True means nobody was
    /// holding the row (and we now are, until the transaction ends).
    async fn trylock(&mut self, conn: &mut PgConnection) -> Result<bool, QueueError> {
        lock_work_row(conn, self.work_table(), self.job_id()).await
    }

    async fn before_work(&mut self, conn: &mut PgConnection) -> Result<bool, WorkError> {
        let query = format!(r#"DELETE FROM "{}" WHERE work_id = $1"#, self.work_table());
        let result = sqlx::query(&query)
            .bind(self.work_id())
            .execute(&mut *conn)
            .await?;

        // A row that vanished between load and lock was finished by someone
        // else; veto the remaining phases instead of running work twice.
        Ok(result.rows_affected() > 0)
    }

    async fn do_work(&mut self, conn: &mut PgConnection) -> Result<(), WorkError>;

    async fn after_work(&mut self, _conn: &mut PgConnection) -> Result<(), WorkError> {
        Ok(())
    }
}

/// A kind of work: knows its table name and how to load payload rows for a
/// job. One instance per work type is registered at startup.
#[async_trait]
pub trait WorkType: Send + Sync {
    /// The name of the table holding this type's payload rows. Doubles as the
    /// registry key and as `job.work_type`.
    fn work_type(&self) -> &'static str;

    /// Load the payload row(s) for a job. Zero or one result is expected;
    /// anything else is treated as no work present.
    async fn load_for_job(
        &self,
        conn: &mut PgConnection,
        job_id: i64,
    ) -> Result<Vec<Box<dyn WorkItem>>, QueueError>;

    /// Number of payload rows currently in the table.
    async fn count(&self, conn: &mut PgConnection) -> Result<i64, QueueError> {
        let query = format!(r#"SELECT COUNT(*) FROM "{}""#, self.work_type());
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&mut *conn).await?;
        Ok(count)
    }
}

static WORK_TYPES: Lazy<RwLock<HashMap<&'static str, Arc<dyn WorkType>>>> =
    Lazy::new(Default::default);

/// Register a work type under its table name. First registration of a name
/// wins; registering the same type twice is a no-op, so this is safe to call
/// from multiple startup paths.
pub fn register_work_type(work: Arc<dyn WorkType>) {
    let mut map = WORK_TYPES.write().expect("poisoned work type registry");
    map.entry(work.work_type()).or_insert(work);
}

/// Resolve a `work_type` name to its registered implementation. A missing
/// name is fatal for the job that referenced it.
pub fn work_type_for(name: &str) -> Result<Arc<dyn WorkType>, QueueError> {
    let map = WORK_TYPES.read().expect("poisoned work type registry");
    map.get(name)
        .cloned()
        .ok_or_else(|| QueueError::UnknownWorkType(name.to_owned()))
}

pub fn registered_work_types() -> Vec<Arc<dyn WorkType>> {
    let map = WORK_TYPES.read().expect("poisoned work type registry");
    map.values().cloned().collect()
}

pub fn work_type_count() -> usize {
    let map = WORK_TYPES.read().expect("poisoned work type registry");
    map.len()
}

/// Clear the registry. Tests only.
pub fn reset_registry() {
    let mut map = WORK_TYPES.write().expect("poisoned work type registry");
    map.clear();
}
