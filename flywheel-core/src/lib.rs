mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so we
// can refactor the internals without breaking the public API

// Types
mod types;
pub use types::JobDescriptor;
pub use types::JobItem;
pub use types::NewJob;

// Errors
mod error;
// Errors about one job's execution: temporary, failed, already running
pub use error::JobError;
// Errors about the queue itself: postgres/network errors, unknown work types
pub use error::QueueError;
// What work payload phases return
pub use error::WorkError;

// Work payloads
mod work;
pub use work::lock_work_row;
pub use work::register_work_type;
pub use work::registered_work_types;
pub use work::reset_registry;
pub use work::work_type_count;
pub use work::work_type_for;
pub use work::WorkItem;
pub use work::WorkType;

// Queue handle
mod queue;
pub use queue::JobQueue;

// Record operations usable without a handle
pub use ops::job::create_job;
pub use ops::job::load_job;
pub use ops::job::next_job;
pub use ops::job::next_jobs;

// Dispatch
mod dispatch;
pub use dispatch::handle_orphan;
pub use dispatch::ultimately_perform;
pub use dispatch::OrphanOutcome;

// Drain helpers, used by tests that need to wait for queue consistency
mod drain;
pub use drain::wait_empty;
pub use drain::wait_job_done;
pub use drain::wait_work_done;

// Histogram
mod stats;
pub use stats::histogram;
pub use stats::reset_completions;
pub use stats::WorkTypeCounts;

// Config
mod config;
pub use config::PoolConfig;
pub use config::SqlDialect;

// When a job can't run because its payload row is locked, reschedule it this
// many seconds in the future, scaled by the failure count.
pub const LOCK_RESCHEDULE_INTERVAL: i64 = 60;
// When a job fails, reschedule it this many seconds in the future, scaled by
// the failure count.
pub const FAILURE_RESCHEDULE_INTERVAL: i64 = 60;
