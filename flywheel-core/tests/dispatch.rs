use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::{
    enqueue_test_work, execution_count, fetch_job, lands_about, runnable_job, setup_test_work,
    work_row_count, TestWorkType, TEST_WORK_TABLE,
};
use flywheel_core::{
    create_job, handle_orphan, histogram, next_job, ultimately_perform, wait_empty, wait_job_done,
    wait_work_done, NewJob, OrphanOutcome, QueueError, SqlDialect, WorkType,
};
use sqlx::PgPool;

mod common;

#[sqlx::test(migrations = "./migrations")]
async fn perform_deletes_job_and_work_row(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    ultimately_perform(&db, job_id)
        .await
        .expect("perform should succeed");

    assert!(fetch_job(&db, job_id).await.is_none());
    assert_eq!(work_row_count(&db, job_id).await, 0);
    assert_eq!(execution_count(&db, job_id).await, 1);

    let counts = histogram(&db).await.unwrap();
    let test_work = counts.get(TEST_WORK_TABLE).expect("registered type");
    assert!(test_work.completed >= 1);
    assert!(test_work.time > 0.0);
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_requeues_failed_work(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "fail", &runnable_job()).await;

    let before = Utc::now();
    ultimately_perform(&db, job_id)
        .await
        .expect("failures are recovered locally");

    let job = fetch_job(&db, job_id).await.expect("job should remain");
    assert_eq!(job.failed, 1);
    assert!(job.assigned.is_none());
    assert!(job.overdue.is_none());
    assert!(lands_about(&job.not_before, &before, 60));

    // The attempt was rolled back, so the payload row survived untouched
    assert_eq!(work_row_count(&db, job_id).await, 1);
    assert_eq!(execution_count(&db, job_id).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_scales_temporary_delay_with_failures(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "temporary", &runnable_job()).await;

    // First attempt: the declared 5s delay, one failure on the books
    let before = Utc::now();
    ultimately_perform(&db, job_id).await.unwrap();
    let job = fetch_job(&db, job_id).await.unwrap();
    assert_eq!(job.failed, 1);
    assert!(lands_about(&job.not_before, &before, 5));

    // Make it due again and retry: the delay now scales with the count
    sqlx::query("UPDATE job SET not_before = $1 WHERE job_id = $2")
        .bind(Utc::now() - Duration::seconds(1))
        .bind(job_id)
        .execute(&db)
        .await
        .unwrap();

    let before = Utc::now();
    ultimately_perform(&db, job_id).await.unwrap();
    let job = fetch_job(&db, job_id).await.unwrap();
    assert_eq!(job.failed, 2);
    assert!(lands_about(&job.not_before, &before, 10));
    assert_eq!(work_row_count(&db, job_id).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_defers_when_payload_is_locked(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    // Another process is running this job: it holds the payload row lock
    let mut holder = db.begin().await.unwrap();
    sqlx::query("SELECT work_id FROM test_work WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_one(&mut *holder)
        .await
        .unwrap();

    let before = Utc::now();
    ultimately_perform(&db, job_id)
        .await
        .expect("lock conflicts are recovered locally");

    let job = fetch_job(&db, job_id).await.expect("job should remain");
    // A lock conflict is not a failure, but the job does get pushed out
    assert_eq!(job.failed, 0);
    assert!(job.assigned.is_none());
    assert!(lands_about(&job.not_before, &before, 60));
    assert_eq!(execution_count(&db, job_id).await, 0);

    holder.rollback().await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_performs_run_the_work_once(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    let (first, second) = tokio::join!(
        ultimately_perform(&db, job_id),
        ultimately_perform(&db, job_id),
    );
    first.expect("classified outcomes are recovered");
    second.expect("classified outcomes are recovered");

    assert_eq!(execution_count(&db, job_id).await, 1);
    assert!(wait_job_done(&db, StdDuration::from_secs(5), job_id)
        .await
        .unwrap());
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_is_quiet_for_missing_jobs(db: PgPool) {
    setup_test_work(&db).await;

    ultimately_perform(&db, 424242)
        .await
        .expect("a vanished job is not an error");
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_surfaces_unknown_work_types(db: PgPool) {
    setup_test_work(&db).await;

    let mut txn = db.begin().await.unwrap();
    let new = NewJob::new("mystery_work", Utc::now() - Duration::minutes(1));
    let job_id = create_job(&mut txn, &new).await.unwrap();
    txn.commit().await.unwrap();

    let result = ultimately_perform(&db, job_id).await;
    assert!(matches!(result, Err(QueueError::UnknownWorkType(name)) if name == "mystery_work"));

    // The row is left alone for the overdue machinery to retry later
    assert!(fetch_job(&db, job_id).await.is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn perform_deletes_jobs_with_no_work_row(db: PgPool) {
    setup_test_work(&db).await;

    let mut txn = db.begin().await.unwrap();
    let job_id = create_job(&mut txn, &runnable_job()).await.unwrap();
    txn.commit().await.unwrap();

    ultimately_perform(&db, job_id).await.unwrap();
    assert!(fetch_job(&db, job_id).await.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn before_work_can_veto_execution(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "skip", &runnable_job()).await;

    ultimately_perform(&db, job_id).await.unwrap();

    // The run still counts as handled: both rows gone, nothing executed
    assert!(fetch_job(&db, job_id).await.is_none());
    assert_eq!(work_row_count(&db, job_id).await, 0);
    assert_eq!(execution_count(&db, job_id).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn orphaned_jobs_are_requeued(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    let mut job = fetch_job(&db, job_id).await.unwrap();
    {
        let mut conn = db.acquire().await.unwrap();
        // Claimed ten minutes ago, deadline long gone, and the claiming
        // worker is dead: nobody holds the payload lock
        job.assign(conn.as_mut(), Utc::now() - Duration::minutes(10), 60)
            .await
            .unwrap();
    }

    let mut txn = db.begin().await.unwrap();
    let mut selected = next_job(&mut txn, Utc::now(), 0, SqlDialect::General)
        .await
        .unwrap()
        .expect("the orphan should be selectable");
    assert_eq!(selected.job_id, job_id);

    let outcome = handle_orphan(&mut txn, &mut selected, 300).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(outcome, OrphanOutcome::Requeued);
    let stored = fetch_job(&db, job_id).await.unwrap();
    assert!(stored.assigned.is_none());
    assert!(stored.overdue.is_none());
    assert_eq!(stored.failed, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn running_overdue_jobs_get_their_deadline_bumped(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    let assigned_at = Utc::now() - Duration::minutes(10);
    let mut job = fetch_job(&db, job_id).await.unwrap();
    {
        let mut conn = db.acquire().await.unwrap();
        job.assign(conn.as_mut(), assigned_at, 60).await.unwrap();
    }

    // The claiming worker is alive and holds the payload lock
    let mut holder = db.begin().await.unwrap();
    sqlx::query("SELECT work_id FROM test_work WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_one(&mut *holder)
        .await
        .unwrap();

    let old_overdue = job.overdue.unwrap();
    let mut txn = db.begin().await.unwrap();
    let outcome = handle_orphan(&mut txn, &mut job, 300).await.unwrap();
    txn.commit().await.unwrap();
    holder.rollback().await.unwrap();

    assert_eq!(outcome, OrphanOutcome::StillRunning);
    let stored = fetch_job(&db, job_id).await.unwrap();
    assert_eq!(stored.failed, 0);
    assert_eq!(
        stored.overdue.unwrap().timestamp(),
        (old_overdue + Duration::seconds(300)).timestamp(),
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn drain_helpers_observe_the_queue(db: PgPool) {
    setup_test_work(&db).await;
    let job_id = enqueue_test_work(&db, "ok", &runnable_job()).await;

    // Work pending: both waits time out quickly
    assert!(!wait_empty(&db, StdDuration::from_millis(300)).await.unwrap());
    let work_types: Vec<Arc<dyn WorkType>> = vec![Arc::new(TestWorkType)];
    assert!(!wait_work_done(&db, StdDuration::from_millis(300), &work_types)
        .await
        .unwrap());

    ultimately_perform(&db, job_id).await.unwrap();

    assert!(wait_job_done(&db, StdDuration::from_secs(5), job_id)
        .await
        .unwrap());
    assert!(wait_empty(&db, StdDuration::from_secs(5)).await.unwrap());
    assert!(wait_work_done(&db, StdDuration::from_secs(5), &work_types)
        .await
        .unwrap());
}

#[sqlx::test(migrations = "./migrations")]
async fn histogram_breaks_down_queue_state(db: PgPool) {
    setup_test_work(&db).await;

    // One late job, one future job, one assigned job, one failed job
    let _late = enqueue_test_work(&db, "ok", &runnable_job()).await;
    let _future =
        enqueue_test_work(&db, "ok", &NewJob::new(TEST_WORK_TABLE, Utc::now() + Duration::hours(1)))
            .await;

    let assigned_id = enqueue_test_work(&db, "ok", &runnable_job()).await;
    let mut assigned = fetch_job(&db, assigned_id).await.unwrap();
    {
        let mut conn = db.acquire().await.unwrap();
        assigned.assign(conn.as_mut(), Utc::now(), 300).await.unwrap();
    }

    let failed_id = enqueue_test_work(&db, "ok", &runnable_job()).await;
    let mut failed = fetch_job(&db, failed_id).await.unwrap();
    {
        let mut conn = db.acquire().await.unwrap();
        failed.failed_to_run(conn.as_mut(), false, None).await.unwrap();
    }

    let counts = histogram(&db).await.unwrap();
    let test_work = counts.get(TEST_WORK_TABLE).expect("registered type");
    assert_eq!(test_work.queued, 4);
    assert_eq!(test_work.assigned, 1);
    // The failed job was pushed into the future, so only one row is late
    assert_eq!(test_work.late, 1);
    assert_eq!(test_work.failed, 1);
}
