//! Job trigger record: the durable duplicate-run marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SchedulerId;

/// "Job `job_name` was already dispatched for slot `scheduled_time`."
///
/// The pair `(job_name, scheduled_time)` is unique in storage. Nobody owns the
/// row; its existence is the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub job_name: String,
    pub scheduled_time: DateTime<Utc>,
    /// Scheduler instance that won the slot.
    pub dispatched_by: SchedulerId,
    pub dispatched_at: DateTime<Utc>,
}

impl TriggerRecord {
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.job_name, self.scheduled_time)
    }
}
