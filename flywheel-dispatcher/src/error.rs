use flywheel_core::QueueError;
use thiserror::Error;

// Errors here are never part of a job's outcome, they indicate bad dispatcher
// health. As a general rule, if one of these escapes the loop, we let the
// process fall over so supervision notices.
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error(transparent)]
    QueueError(#[from] QueueError),
    // We failed doing some kind of setup, like binding the status listener
    #[error("error during startup: {0}")]
    StartupError(String),
}
