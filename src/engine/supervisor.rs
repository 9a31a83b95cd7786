//! Owns every poll loop of a running service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consumer::WorkItemConsumer;
use super::cron::{CronJob, CronJobWorker};
use super::poll::{DEFAULT_ERROR_COOLDOWN, PollLoop};
use crate::dispatch::HttpDispatcher;
use crate::error::{Error, Result};
use crate::health::HealthReport;
use crate::shard::Shard;
use crate::store::SharedStore;

/// Default idle interval of the consumer loops.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub error_cooldown: Duration,
    /// Without jobs no cron loop is started.
    pub cron_jobs: Vec<CronJob>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_cooldown: DEFAULT_ERROR_COOLDOWN,
            cron_jobs: Vec::new(),
        }
    }
}

pub struct Supervisor {
    store: SharedStore,
    consumers: Vec<(Shard, Arc<PollLoop>)>,
    cron: Option<Arc<PollLoop>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build one consumer loop per shard, plus the cron loop when jobs are
    /// configured. Nothing runs until [`Supervisor::start`].
    pub fn new(store: SharedStore, dispatcher: Arc<HttpDispatcher>, config: SupervisorConfig) -> Self {
        let cancel = CancellationToken::new();

        let consumers: Vec<(Shard, Arc<PollLoop>)> = store
            .sharding()
            .shards()
            .map(|shard| {
                let worker = WorkItemConsumer::new(
                    Arc::clone(&store),
                    Arc::clone(&dispatcher),
                    shard,
                    config.poll_interval,
                );
                let poll = PollLoop::new(Arc::new(worker), cancel.clone(), config.error_cooldown);
                (shard, poll)
            })
            .collect();

        let cron = (!config.cron_jobs.is_empty()).then(|| {
            let wake: Vec<Arc<PollLoop>> = consumers.iter().map(|(_, l)| Arc::clone(l)).collect();
            let worker = CronJobWorker::new(Arc::clone(&store), config.cron_jobs)
                .on_fire(move || wake.iter().for_each(|l| l.poll_now()));
            PollLoop::new(Arc::new(worker), cancel.clone(), config.error_cooldown)
        });

        Self {
            store,
            consumers,
            cron,
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Spawn every loop onto the runtime.
    pub fn start(&self) {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !handles.is_empty() {
            warn!("supervisor already started");
            return;
        }
        for poll in self.loops() {
            handles.push(tokio::spawn(Arc::clone(poll).run()));
        }
        info!(
            consumers = self.consumers.len(),
            cron = self.cron.is_some(),
            "supervisor started"
        );
    }

    /// Wake every consumer loop from its idle sleep.
    pub fn poll_now(&self) {
        for (_, poll) in &self.consumers {
            poll.poll_now();
        }
    }

    /// Run exactly one execution on the consumer owning `queue_name`.
    /// Returns whether an item was claimed.
    pub async fn process_one(&self, queue_name: &str) -> Result<bool> {
        let shard = self.store.sharding().shard_for(queue_name);
        let poll = self.consumer(shard)?;
        poll.execute_once().await
    }

    /// Run every consumer until none claims anything. Returns the number of
    /// items settled.
    pub async fn drain(&self) -> Result<usize> {
        let mut settled = 0;
        loop {
            let mut progressed = false;
            for (_, poll) in &self.consumers {
                while poll.execute_once().await? {
                    settled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(settled);
            }
        }
    }

    pub async fn health(&self) -> HealthReport {
        let workers = self.loops().map(|poll| poll.health()).collect();
        let queues = self
            .store
            .queue_health_check()
            .await
            .map_err(|e| e.to_string());
        HealthReport::aggregate(workers, queues)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal every loop to stop and wait for in-flight executions.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll loop task ended abnormally");
            }
        }
        info!("supervisor stopped");
    }

    fn consumer(&self, shard: Shard) -> Result<&Arc<PollLoop>> {
        self.consumers
            .iter()
            .find(|(s, _)| *s == shard)
            .map(|(_, poll)| poll)
            .ok_or_else(|| Error::NotFound(format!("no consumer for shard {shard}")))
    }

    fn loops(&self) -> impl Iterator<Item = &Arc<PollLoop>> {
        self.consumers.iter().map(|(_, poll)| poll).chain(self.cron.iter())
    }
}
