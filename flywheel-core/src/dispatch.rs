use std::time::Instant;

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error};

use crate::error::{JobError, QueueError, WorkError};
use crate::ops::job::load_job;
use crate::stats::record_completion;
use crate::types::JobItem;
use crate::work::{work_type_for, WorkItem};

/// Eventually, somebody actually has to do the job. Load it, resolve and run
/// its payload under the payload row lock, delete it, and account for every
/// way that can go wrong.
///
/// The whole attempt runs on one transaction from `pool`. Classified failures
/// (payload asked for a retry, payload failed, payload already running
/// elsewhere) roll that transaction back and record the reschedule in a
/// separate follow-up transaction, because the payload row lock has to be
/// released before the job row is made runnable again. Those outcomes are
/// recovered here and return Ok. Anything unclassified is surfaced to the
/// caller; the job row keeps its claim and comes back when its overdue
/// deadline fires.
pub async fn ultimately_perform(pool: &PgPool, job_id: i64) -> Result<(), QueueError> {
    let started = Instant::now();

    debug!("job {} starting to run", job_id);
    let mut txn = pool.begin().await?;

    let Some(mut job) = load_job(&mut txn, job_id).await? else {
        // The record has already been removed
        txn.commit().await?;
        debug!("job {} already removed t={:.3}", job_id, elapsed_ms(started));
        return Ok(());
    };

    let work_type = job.work_type.clone();
    let not_before = job.not_before;
    let failed = job.failed;
    let labels = [("work_type", work_type.clone())];

    match run(&mut job, &mut txn).await {
        Ok(()) => {
            txn.commit().await?;
            let elapsed = started.elapsed().as_secs_f64();
            record_completion(&work_type, elapsed);
            metrics::counter!("flywheel_jobs_completed", &labels).increment(1);
            metrics::histogram!("flywheel_job_run_seconds", &labels).record(elapsed);
            debug!(
                "job {} completed {} t={:.3} over={}",
                job_id,
                work_type,
                elapsed * 1000.0,
                (Utc::now() - not_before).num_milliseconds(),
            );
            Ok(())
        }
        Err(JobError::Temporary { delay }) => {
            txn.rollback().await?;
            metrics::counter!("flywheel_jobs_deferred", &labels).increment(1);
            debug!(
                "job {} temporary failure #{} {} t={:.3}",
                job_id,
                failed + 1,
                work_type,
                elapsed_ms(started),
            );
            requeue(pool, job_id, false, Some(delay * (failed as i64 + 1))).await
        }
        Err(JobError::Failed(_)) => {
            txn.rollback().await?;
            metrics::counter!("flywheel_jobs_failed", &labels).increment(1);
            debug!(
                "job {} failed {} t={:.3}",
                job_id,
                work_type,
                elapsed_ms(started),
            );
            requeue(pool, job_id, false, None).await
        }
        Err(JobError::Running) => {
            txn.rollback().await?;
            metrics::counter!("flywheel_jobs_locked", &labels).increment(1);
            debug!(
                "job {} locked {} t={:.3}",
                job_id,
                work_type,
                elapsed_ms(started),
            );
            requeue(pool, job_id, true, None).await
        }
        Err(JobError::Queue(queue_error)) => {
            txn.rollback().await?;
            error!(
                "job {} unknown error t={:.3}: {}",
                job_id,
                elapsed_ms(started),
                queue_error,
            );
            Err(queue_error)
        }
    }
}

/// Run the payload for a loaded job with appropriate locking, then delete the
/// job row. A job whose payload row count is anything but one has no work
/// present and is just deleted.
async fn run(job: &mut JobItem, conn: &mut PgConnection) -> Result<(), JobError> {
    let source = work_type_for(&job.work_type)?;
    let mut items = source.load_for_job(conn, job.job_id).await?;

    if items.len() == 1 {
        if let Some(mut work) = items.pop() {
            if !work.runlock(conn).await? {
                return Err(JobError::Running);
            }

            if let Err(work_error) = run_phases(work.as_mut(), conn).await {
                return Err(match work_error {
                    WorkError::Temporary { delay } => JobError::Temporary { delay },
                    WorkError::Failure(cause) => {
                        error!(
                            "job {} work item {} failed: {}",
                            job.job_id,
                            work.work_id(),
                            cause,
                        );
                        JobError::Failed(cause)
                    }
                });
            }
        }
    }

    // Deleting ourselves must be the last thing done, so the job row is not
    // kept locked for long. Already gone is fine.
    job.delete(conn).await?;
    Ok(())
}

async fn run_phases(work: &mut dyn WorkItem, conn: &mut PgConnection) -> Result<(), WorkError> {
    let ok_to_go = work.before_work(conn).await?;
    if ok_to_go {
        work.do_work(conn).await?;
        work.after_work(conn).await?;
    }
    Ok(())
}

/// The follow-up transaction after a failed attempt: re-load the record and
/// push it back into the queue. The job may have vanished in the meantime,
/// which just means somebody else dealt with it.
async fn requeue(
    pool: &PgPool,
    job_id: i64,
    locked: bool,
    delay: Option<i64>,
) -> Result<(), QueueError> {
    let mut txn = pool.begin().await?;

    match load_job(&mut txn, job_id).await? {
        None => {
            debug!("job {} disappeared before requeue", job_id);
        }
        Some(mut job) => {
            debug!("job {} marking as failed {}", job_id, job.failed + 1);
            job.failed_to_run(&mut txn, locked, delay).await?;
        }
    }

    txn.commit().await?;
    Ok(())
}

/// What overdue detection decided about an assigned job past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanOutcome {
    /// The payload row is still locked, so the job is alive; its deadline got
    /// extended instead.
    StillRunning,
    /// Nobody held the payload lock, the worker is gone. The job was pushed
    /// back into the queue.
    Requeued,
}

/// Decide what to do with a job that is assigned but past its overdue
/// deadline. Runs on the caller's transaction, which should hold the job row
/// lock from selection.
pub async fn handle_orphan(
    conn: &mut PgConnection,
    job: &mut JobItem,
    bump_seconds: i64,
) -> Result<OrphanOutcome, QueueError> {
    if job.is_running(conn).await? {
        job.bump_overdue(conn, bump_seconds).await?;
        debug!(
            "job {} still running, overdue bumped {}s",
            job.job_id, bump_seconds,
        );
        Ok(OrphanOutcome::StillRunning)
    } else {
        job.failed_to_run(conn, false, None).await?;
        debug!("job {} orphaned, requeued for {}", job.job_id, job.not_before);
        Ok(OrphanOutcome::Requeued)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
