//! Persisted cron job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobInfo {
    pub name: String,
    pub last_ran_at: DateTime<Utc>,
    pub active: bool,
}

impl CronJobInfo {
    /// State of a job that has never been recorded.
    pub fn never_ran(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_ran_at: DateTime::<Utc>::UNIX_EPOCH,
            active: true,
        }
    }
}
