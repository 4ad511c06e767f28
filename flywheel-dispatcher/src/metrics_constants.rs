pub const TICK_TIME: &str = "flywheel_dispatcher_tick_ms";
pub const SELECT_TIME: &str = "flywheel_dispatcher_select_ms";
pub const JOBS_DISPATCHED: &str = "flywheel_jobs_dispatched";
pub const JOBS_ORPHANED: &str = "flywheel_jobs_orphaned";
pub const JOBS_BUMPED: &str = "flywheel_jobs_overdue_bumped";
pub const JOB_ERRORS: &str = "flywheel_job_errors";
pub const AVAILABLE_PERMITS: &str = "flywheel_dispatcher_available_permits";

pub const OUTCOME_LABEL: &str = "outcome";
