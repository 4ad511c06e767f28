use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::QueueError;
use crate::work::registered_work_types;

// Process-local completion accounting. Readers tolerate stale values, so a
// plain RwLock around the map is plenty.
#[derive(Debug, Default, Clone, Copy)]
struct Completion {
    count: u64,
    seconds: f64,
}

static COMPLETIONS: Lazy<RwLock<HashMap<String, Completion>>> = Lazy::new(Default::default);

pub(crate) fn record_completion(work_type: &str, seconds: f64) {
    let mut map = COMPLETIONS.write().expect("poisoned completion counters");
    let entry = map.entry(work_type.to_owned()).or_default();
    entry.count += 1;
    entry.seconds += seconds;
}

/// Clear the process-local completion counters. Tests only.
pub fn reset_completions() {
    let mut map = COMPLETIONS.write().expect("poisoned completion counters");
    map.clear();
}

/// Queue state for one work type, suitable for a status endpoint.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct WorkTypeCounts {
    /// Job rows referencing this work type.
    pub queued: u64,
    /// Of those, rows currently claimed by a dispatcher.
    pub assigned: u64,
    /// Unclaimed rows that are already past their `not_before`.
    pub late: u64,
    /// Rows with at least one failed attempt behind them.
    pub failed: u64,
    /// Jobs completed by this process since startup.
    pub completed: u64,
    /// Total seconds this process spent completing them.
    pub time: f64,
}

/// A per-work-type snapshot of the queue, covering every registered work
/// type (with zeroes for idle ones) plus any types found in the table.
pub async fn histogram(pool: &PgPool) -> Result<HashMap<String, WorkTypeCounts>, QueueError> {
    let mut results: HashMap<String, WorkTypeCounts> = HashMap::new();

    {
        let completions = COMPLETIONS.read().expect("poisoned completion counters");
        for work_type in registered_work_types() {
            let name = work_type.work_type().to_string();
            let completion = completions.get(&name).copied().unwrap_or_default();
            results.insert(
                name,
                WorkTypeCounts {
                    completed: completion.count,
                    time: completion.seconds,
                    ..Default::default()
                },
            );
        }
    }

    let now = Utc::now();
    let rows: Vec<(String, Option<DateTime<Utc>>, DateTime<Utc>, i32)> =
        sqlx::query_as("SELECT work_type, assigned, not_before, failed FROM job")
            .fetch_all(pool)
            .await?;

    for (work_type, assigned, not_before, failed) in rows {
        let entry = results.entry(work_type).or_default();
        entry.queued += 1;
        if assigned.is_some() {
            entry.assigned += 1;
        }
        if assigned.is_none() && not_before < now {
            entry.late += 1;
        }
        if failed > 0 {
            entry.failed += 1;
        }
    }

    Ok(results)
}
