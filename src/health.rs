//! Service health aggregation.
//!
//! Combines each poll loop's liveness with the store's queue health into a
//! single verdict plus a human-readable report.

use std::fmt;

use serde::Serialize;

use crate::store::QueueHealth;

/// Liveness of a single poll loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub healthy: bool,
    pub name: String,
    pub state: String,
    pub info: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub workers: Vec<WorkerHealth>,
    /// `None` when the store could not be queried.
    pub queues: Option<QueueHealth>,
    pub store_error: Option<String>,
}

impl HealthReport {
    pub fn aggregate(
        workers: Vec<WorkerHealth>,
        queues: std::result::Result<QueueHealth, String>,
    ) -> Self {
        let (queues, store_error) = match queues {
            Ok(q) => (Some(q), None),
            Err(e) => (None, Some(e)),
        };
        let healthy = workers.iter().all(|w| w.healthy)
            && queues.map(|q| q.healthy).unwrap_or(false);
        Self {
            healthy,
            workers,
            queues,
            store_error,
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}",
            if self.healthy { "healthy" } else { "unhealthy" }
        )?;
        for w in &self.workers {
            let mark = if w.healthy { "ok" } else { "FAIL" };
            writeln!(f, "  [{mark}] {} ({}): {}", w.name, w.state, w.info)?;
        }
        match (&self.queues, &self.store_error) {
            (Some(q), _) if q.healthy => writeln!(f, "  [ok] queues"),
            (Some(q), _) => writeln!(
                f,
                "  [FAIL] queues: {} with error count at threshold",
                q.unhealthy_queues
            ),
            (None, Some(e)) => writeln!(f, "  [FAIL] store: {e}"),
            (None, None) => writeln!(f, "  [FAIL] store: unknown"),
        }
    }
}
