use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A row of the `job` table. This is internal book keeping for the work
/// payloads: it decides when a job runs, who has claimed it, and when a
/// claimed job should be treated as abandoned.
///
/// `not_before` is the earliest time the job may run. `assigned` is set when a
/// dispatcher claims the job, together with `overdue`, the point in the future
/// after which the claim is suspect. A dispatcher that finds an assigned job
/// past its `overdue` probes the payload row lock to decide between extending
/// the deadline and requeueing. `failed` counts failed or bumped attempts and
/// drives the reschedule backoff.
///
/// While a job executes, only the payload row is locked, never this row. That
/// keeps the job row available for `overdue` updates during long runs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobItem {
    pub job_id: i64,
    pub work_type: String,
    pub priority: i32,
    pub weight: i32,
    pub not_before: DateTime<Utc>,
    pub assigned: Option<DateTime<Utc>>,
    pub overdue: Option<DateTime<Utc>>,
    pub failed: i32,
    pub pause: i32,
}

impl JobItem {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.job_id,
            weight: self.weight,
            work_type: self.work_type.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause != 0
    }
}

/// The chunk of data needed to enqueue a job. The matching payload row must
/// be inserted in the same transaction, keyed by the returned job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub work_type: String,
    pub priority: i32,
    pub weight: i32,
    pub not_before: DateTime<Utc>,
}

impl NewJob {
    pub fn new(work_type: &str, not_before: DateTime<Utc>) -> Self {
        Self {
            work_type: work_type.to_owned(),
            priority: 0,
            weight: 0,
            not_before,
        }
    }
}

/// The triple handed from the dispatcher to a worker. The worker re-loads the
/// full record under its own transaction, so this is all that ever crosses a
/// process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: i64,
    pub weight: i32,
    pub work_type: String,
}

/// Wire format is a comma-joined `"job_id,weight,work_type"`, decoded
/// positionally. Fixed for interoperability with existing workers.
impl fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.job_id, self.weight, self.work_type)
    }
}

impl FromStr for JobDescriptor {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::InvalidDescriptor(s.to_owned());

        let mut parts = s.split(',');
        let job_id = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let weight = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(invalid)?;
        let work_type = parts.next().ok_or_else(invalid)?.to_owned();
        if work_type.is_empty() || parts.next().is_some() {
            return Err(invalid());
        }

        Ok(JobDescriptor {
            job_id,
            weight,
            work_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips() {
        let descriptor = JobDescriptor {
            job_id: 42,
            weight: 7,
            work_type: "push_notification_work".to_string(),
        };

        let encoded = descriptor.to_string();
        assert_eq!(encoded, "42,7,push_notification_work");
        assert_eq!(encoded.parse::<JobDescriptor>().unwrap(), descriptor);
    }

    #[test]
    fn descriptor_rejects_bad_input() {
        assert!("".parse::<JobDescriptor>().is_err());
        assert!("42".parse::<JobDescriptor>().is_err());
        assert!("42,7".parse::<JobDescriptor>().is_err());
        assert!("42,7,".parse::<JobDescriptor>().is_err());
        assert!("x,7,work".parse::<JobDescriptor>().is_err());
        assert!("42,y,work".parse::<JobDescriptor>().is_err());
        assert!("42,7,work,extra".parse::<JobDescriptor>().is_err());
    }

    #[test]
    fn descriptor_from_job() {
        let job = JobItem {
            job_id: 9,
            work_type: "test_work".to_string(),
            priority: 1,
            weight: 3,
            not_before: Utc::now(),
            assigned: None,
            overdue: None,
            failed: 0,
            pause: 0,
        };

        let descriptor = job.descriptor();
        assert_eq!(descriptor.job_id, 9);
        assert_eq!(descriptor.weight, 3);
        assert_eq!(descriptor.work_type, "test_work");
    }
}
