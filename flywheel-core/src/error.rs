use thiserror::Error;

/// Errors about the queue itself: postgres/network failures, descriptors
/// that don't parse, work types nobody registered.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("sqlx error: {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("no work type registered for '{0}'")]
    UnknownWorkType(String),
    #[error("'{0}' is not a valid job descriptor")]
    InvalidDescriptor(String),
}

/// The classified outcome of one attempt to run a job. Everything except
/// `Queue` is recovered locally by rescheduling the job record.
#[derive(Error, Debug)]
pub enum JobError {
    /// The payload declared it cannot run right now and asked to be retried
    /// after `delay` seconds (scaled by the failure count when rescheduling).
    #[error("job is temporarily unable to run, retry in {delay}s")]
    Temporary { delay: i64 },
    /// A work phase failed with an unclassified error.
    #[error("job failed to run: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Another process holds the payload row lock.
    #[error("job is already running")]
    Running,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What a work payload's phases may return. Anything that is not `Temporary`
/// counts as a permanent failure for that attempt and bumps the failure count.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("work is temporarily unable to run, retry in {delay}s")]
    Temporary { delay: i64 },
    #[error("work item failed: {0}")]
    Failure(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl WorkError {
    pub fn temporary(delay: i64) -> Self {
        WorkError::Temporary { delay }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        WorkError::Failure(message.into().into())
    }
}

impl From<sqlx::Error> for WorkError {
    fn from(error: sqlx::Error) -> Self {
        WorkError::Failure(Box::new(error))
    }
}
