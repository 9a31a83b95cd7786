//! Work item consumer: one per shard.
//!
//! Each execution claims at most one item, dispatches it and settles it in
//! the store according to the dispatch outcome.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute::HTTP_RESPONSE_STATUS_CODE;
use tokio::time::Instant;
use tracing::{Instrument, debug, info};

use super::poll::PollWorker;
use crate::dispatch::{DispatchOutcome, HttpDispatcher};
use crate::error::Result;
use crate::shard::Shard;
use crate::store::SharedStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_dispatch_span};

/// Minimum spacing between purges of completed history.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

pub struct WorkItemConsumer {
    store: SharedStore,
    dispatcher: Arc<HttpDispatcher>,
    shard: Shard,
    interval: Duration,
    last_purge: Mutex<Option<Instant>>,
}

impl WorkItemConsumer {
    pub fn new(
        store: SharedStore,
        dispatcher: Arc<HttpDispatcher>,
        shard: Shard,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            shard,
            interval,
            last_purge: Mutex::new(None),
        }
    }

    pub fn shard(&self) -> Shard {
        self.shard
    }

    fn purge_due(&self) -> bool {
        let last = self
            .last_purge
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.is_none_or(|at| at.elapsed() >= PURGE_INTERVAL)
    }

    async fn purge_if_due(&self) -> Result<()> {
        if !self.purge_due() {
            return Ok(());
        }
        let removed = self.store.purge_work_items(self.shard).await?;
        *self
            .last_purge
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        if removed > 0 {
            info!(shard = %self.shard, removed, "purged completed work items");
        }
        Ok(())
    }
}

#[async_trait]
impl PollWorker for WorkItemConsumer {
    fn name(&self) -> String {
        format!("consumer-{}", self.shard)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute_one(&self) -> Result<bool> {
        let claim_started = Instant::now();
        let claimed = self.store.next_work_item(self.shard).await?;
        record_duration("claim", claim_started);
        let Some(item) = claimed else {
            self.purge_if_due().await?;
            return Ok(false);
        };

        let span = start_dispatch_span(&item);

        if item.is_noop() {
            debug!(parent: &span, work_item_id = %item.id, queue = %item.queue_name, "completing placeholder");
            self.store.complete_work_item(item.id, self.shard).await?;
            record_outcome(&span, "noop");
            return Ok(true);
        }

        let dispatch_started = Instant::now();
        let outcome = self
            .dispatcher
            .dispatch(&item)
            .instrument(span.clone())
            .await;
        record_duration("dispatch", dispatch_started);

        match &outcome {
            DispatchOutcome::Complete { .. } => {
                self.store.complete_work_item(item.id, self.shard).await?
            }
            DispatchOutcome::Delay { .. } => self.store.delay_work_item(item.id, self.shard).await?,
            DispatchOutcome::Fail { error, .. } => {
                info!(parent: &span, work_item_id = %item.id, queue = %item.queue_name, error = %error, "work item failed");
                self.store.fail_work_item(item.id, self.shard).await?
            }
        }

        let mut labels = vec![KeyValue::new("outcome", outcome.label())];
        if let Some(status) = outcome.status() {
            labels.push(KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)));
        }
        metrics::work_dispatched().add(1, &labels);
        record_outcome(&span, outcome.label());

        // A delayed item is claimable again at once; retry it after the idle
        // interval rather than in the same burst.
        Ok(!matches!(outcome, DispatchOutcome::Delay { .. }))
    }
}
