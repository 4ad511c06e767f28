use std::cmp::min;
use std::sync::Arc;

use chrono::Utc;
use flywheel_core::{handle_orphan, OrphanOutcome};
use tracing::{debug, error, instrument};

use crate::context::AppContext;
use crate::error::DispatcherError;
use crate::metrics_constants::*;

/// One pass of the dispatch loop: select runnable jobs under row locks, deal
/// with any overdue claims among them, stamp the rest as assigned, and hand
/// them to worker tasks once the selection transaction has committed.
///
/// Returns the number of jobs handed off.
#[instrument(skip_all)]
pub async fn tick(context: Arc<AppContext>) -> Result<usize, DispatcherError> {
    let labels = context.metric_labels();

    common_metrics::gauge(
        AVAILABLE_PERMITS,
        &labels,
        context.concurrency_limit.available_permits() as f64,
    );

    // Never claim more jobs than we have permits to run right now.
    let max_jobs = min(
        context.concurrency_limit.available_permits(),
        context.config.batch_size,
    );
    if max_jobs == 0 {
        return Ok(0);
    }

    let now = Utc::now();
    let mut txn = context
        .queue
        .pool()
        .begin()
        .await
        .map_err(flywheel_core::QueueError::from)?;

    let jobs = {
        let _time = common_metrics::timing_guard(SELECT_TIME, &labels);
        context
            .queue
            .next_jobs(&mut txn, now, context.config.min_priority, max_jobs)
            .await?
    };

    let mut descriptors = Vec::with_capacity(jobs.len());
    for mut job in jobs {
        if job.assigned.is_some() {
            // A claim past its deadline sorts ahead of fresh work. Probe it
            // and either extend the deadline or push it back into the queue;
            // requeued jobs become selectable again once their backoff passes.
            match handle_orphan(&mut txn, &mut job, context.config.overdue_bump_seconds).await? {
                OrphanOutcome::StillRunning => {
                    common_metrics::inc(JOBS_BUMPED, &labels, 1);
                }
                OrphanOutcome::Requeued => {
                    common_metrics::inc(JOBS_ORPHANED, &labels, 1);
                }
            }
            continue;
        }

        job.assign(&mut txn, now, context.config.overdue_timeout_seconds)
            .await?;
        descriptors.push(job.descriptor());
    }

    txn.commit()
        .await
        .map_err(flywheel_core::QueueError::from)?;

    let started = descriptors.len();
    for descriptor in descriptors {
        // We grab job permits individually, so that as soon as a job is
        // finished the permit to run another one frees up. This never blocks
        // for long, since we only claimed as many jobs as there were permits.
        let permit = context
            .concurrency_limit
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore has been closed");
        let context = context.clone();
        let labels = labels.clone();

        tokio::spawn(async move {
            debug!(
                "dispatching job {} ({})",
                descriptor.job_id, descriptor.work_type,
            );
            let result = context.queue.perform(descriptor.job_id).await;
            drop(permit);

            match result {
                Ok(()) => common_metrics::inc(JOBS_DISPATCHED, &labels, 1),
                Err(queue_error) => {
                    // The row keeps its claim; overdue detection will pick it
                    // back up once the deadline fires.
                    error!(
                        "job {} ({}) could not be performed: {}",
                        descriptor.job_id, descriptor.work_type, queue_error,
                    );
                    common_metrics::inc(JOB_ERRORS, &labels, 1);
                }
            }
        });
    }

    Ok(started)
}

pub async fn dispatch_loop(context: AppContext) -> Result<(), DispatcherError> {
    let context = Arc::new(context);
    loop {
        context.liveness.report_healthy().await;

        let labels = context.metric_labels();
        let tick_time = common_metrics::timing_guard(TICK_TIME, &labels);
        let started = tick(context.clone()).await?;
        tick_time.fin();

        if started > 0 {
            debug!("dispatched {} jobs", started);
        }
        tokio::time::sleep(context.config.job_poll_interval).await;
    }
}
