//! Generic poll loop.
//!
//! Repeatedly runs a worker's `execute_one`. While it reports more work the
//! loop continues immediately; otherwise it sleeps for the worker's interval
//! unless woken early by [`PollLoop::poll_now`]. Waking cancels only the
//! sleep, never an execution in flight. Shutdown is checked between
//! executions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::health::WorkerHealth;

/// Intervals above this get jittered so workers drift apart.
const JITTER_THRESHOLD: Duration = Duration::from_secs(30);
const JITTER: Duration = Duration::from_secs(5);

/// Pause after a failed execution before polling again.
pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait PollWorker: Send + Sync {
    fn name(&self) -> String;

    /// Idle sleep between polls.
    fn interval(&self) -> Duration;

    /// Whether [`PollLoop::poll_now`] cuts this worker's sleep short.
    fn wakeable(&self) -> bool {
        true
    }

    /// Do one unit of work. Returns whether more work is likely.
    async fn execute_one(&self) -> Result<bool>;
}

/// What a loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Executing,
    Sleeping,
    CoolingDown,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Executing => "executing",
            LoopState::Sleeping => "sleeping",
            LoopState::CoolingDown => "cooling_down",
            LoopState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

struct LoopStatus {
    state: LoopState,
    created_at: DateTime<Utc>,
    last_execution_started: Option<DateTime<Utc>>,
    last_execution_finished: Option<DateTime<Utc>>,
    executions: u64,
    last_error: Option<String>,
}

/// Drives one [`PollWorker`].
pub struct PollLoop {
    worker: Arc<dyn PollWorker>,
    wake: Notify,
    cancel: CancellationToken,
    error_cooldown: Duration,
    status: Mutex<LoopStatus>,
}

impl PollLoop {
    pub fn new(
        worker: Arc<dyn PollWorker>,
        cancel: CancellationToken,
        error_cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            wake: Notify::new(),
            cancel,
            error_cooldown,
            status: Mutex::new(LoopStatus {
                state: LoopState::Idle,
                created_at: Utc::now(),
                last_execution_started: None,
                last_execution_finished: None,
                executions: 0,
                last_error: None,
            }),
        })
    }

    pub fn name(&self) -> String {
        self.worker.name()
    }

    /// Cut the current (or next) idle sleep short.
    pub fn poll_now(&self) {
        if self.worker.wakeable() {
            self.wake.notify_one();
        }
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>) {
        let name = self.worker.name();
        info!(worker = %name, "poll loop started");

        while !self.cancel.is_cancelled() {
            match self.execute_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    self.set_state(LoopState::Sleeping);
                    self.sleep(jittered(self.worker.interval()), self.worker.wakeable())
                        .await;
                }
                Err(e) => {
                    error!(worker = %name, error = %e, cooldown_secs = self.error_cooldown.as_secs(), "poll execution failed");
                    self.update(|status| status.last_error = Some(e.to_string()));
                    self.set_state(LoopState::CoolingDown);
                    self.sleep(self.error_cooldown, false).await;
                }
            }
        }

        self.set_state(LoopState::Stopped);
        info!(worker = %name, "poll loop stopped");
    }

    /// Run the worker once, recording the start for health checks.
    pub async fn execute_once(&self) -> Result<bool> {
        self.update(|status| {
            status.state = LoopState::Executing;
            status.last_execution_started = Some(Utc::now());
            status.executions += 1;
        });
        let result = self.worker.execute_one().await;
        self.update(|status| {
            status.state = LoopState::Idle;
            status.last_execution_finished = Some(Utc::now());
        });
        result
    }

    /// Unhealthy once the loop has gone longer than its interval without
    /// starting an execution. While idle the clock runs from the end of the
    /// last execution, since the next one is due an interval after that.
    pub fn health(&self) -> WorkerHealth {
        let interval = self.worker.interval();
        let allowance = if interval > JITTER_THRESHOLD {
            interval + JITTER
        } else {
            interval
        };
        let allowance = TimeDelta::from_std(allowance).unwrap_or(TimeDelta::MAX);

        let status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let reference = [status.last_execution_started, status.last_execution_finished]
            .into_iter()
            .flatten()
            .fold(status.created_at, |latest, at| latest.max(at));
        let healthy = status.state != LoopState::Stopped && Utc::now() - reference <= allowance;

        let mut info = match status.last_execution_started {
            Some(started) => format!(
                "{} executions, last started {}",
                status.executions,
                started.to_rfc3339()
            ),
            None => "no executions yet".to_string(),
        };
        if let Some(error) = &status.last_error {
            info.push_str(&format!("; last error: {error}"));
        }

        WorkerHealth {
            healthy,
            name: self.worker.name(),
            state: status.state.to_string(),
            info,
        }
    }

    async fn sleep(&self, duration: Duration, wakeable: bool) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.wake.notified(), if wakeable => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    fn set_state(&self, state: LoopState) {
        self.update(|status| status.state = state);
    }

    fn update(&self, f: impl FnOnce(&mut LoopStatus)) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut status);
    }
}

/// `interval` shifted by up to ±5s once it exceeds 30s.
fn jittered(interval: Duration) -> Duration {
    if interval <= JITTER_THRESHOLD {
        return interval;
    }
    let spread = JITTER.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = interval.as_millis() as i64 + offset;
    Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_intervals_are_not_jittered() {
        let interval = Duration::from_secs(10);
        assert_eq!(jittered(interval), interval);
    }

    #[test]
    fn long_intervals_stay_within_jitter_bounds() {
        let interval = Duration::from_secs(60);
        for _ in 0..100 {
            let d = jittered(interval);
            assert!(d >= Duration::from_secs(55) && d <= Duration::from_secs(65));
        }
    }
}
