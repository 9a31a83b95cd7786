//! The Work Item Store contract.
//!
//! Every backend implements [`WorkItemStore`]. All mutations touching a
//! shard's Queue or blocking state run inside that shard's exclusive
//! critical section; no operation ever needs two shard locks.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::model::*;
use crate::shard::{Shard, Sharding};

pub use memory::MemoryStore;

/// Processing lease taken by NextWorkItem.
pub const LEASE_DURATION: TimeDelta = TimeDelta::hours(1);

/// Backoff applied by FailWorkItem.
pub const FAILURE_BACKOFF: TimeDelta = TimeDelta::minutes(5);

/// Queues at or above this error count are never claimed.
pub const MAX_ERROR_COUNT: i32 = 5;

/// Upper bound on completed rows removed per purge call.
pub const PURGE_BATCH_SIZE: i64 = 1000;

/// Completed items older than this are purged.
pub const COMPLETED_RETENTION: TimeDelta = TimeDelta::days(14);

/// Queue-level health, as reported by [`WorkItemStore::queue_health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    /// Queues whose error count reached [`MAX_ERROR_COUNT`].
    pub unhealthy_queues: i64,
}

impl QueueHealth {
    pub fn from_unhealthy_count(unhealthy_queues: i64) -> Self {
        Self {
            healthy: unhealthy_queues == 0,
            unhealthy_queues,
        }
    }
}

pub type SharedStore = Arc<dyn WorkItemStore>;

/// Transactional persistence for work items, queues, blocking messages and
/// cron jobs.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    fn sharding(&self) -> Sharding;

    /// Insert a work item. With duplicate protection, an unattempted item
    /// with the same queue and URL turns this into a no-op.
    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult>;

    /// Ingest, apply the blocking mailbox, then claim the longest-waiting
    /// claimable queue head of `shard`.
    async fn next_work_item(&self, shard: Shard) -> Result<Option<WorkItem>>;

    /// Retire a claimed item and advance its queue.
    async fn complete_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()>;

    /// Count a failure and back the queue off.
    async fn fail_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()>;

    /// Release the lease for an immediate, uncounted retry.
    async fn delay_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()>;

    /// Remove one bounded batch of expired completed items. Returns the
    /// number of rows removed.
    async fn purge_work_items(&self, shard: Shard) -> Result<u64>;

    async fn pause_queue(&self, queue: &QueueRef) -> Result<()>;

    async fn resume_queue(&self, queue: &QueueRef) -> Result<()>;

    /// Clear a queue's error count and backoff so it is claimable again,
    /// e.g. after its circuit breaker tripped. A no-op when the queue is
    /// absent.
    async fn reset_queue(&self, queue: &QueueRef) -> Result<()>;

    async fn acquire_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()>;

    async fn release_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()>;

    async fn queue_state(&self, queue: &QueueRef) -> Result<Option<Queue>>;

    /// Uncompleted items filed under `queue`, oldest first.
    async fn pending_work_items(&self, queue: &QueueRef) -> Result<Vec<WorkItem>>;

    async fn get_cron_job_state(&self) -> Result<Vec<CronJobInfo>>;

    async fn begin_cron_transaction(&self) -> Result<Box<dyn CronTransaction>>;

    async fn queue_health_check(&self) -> Result<QueueHealth>;

    /// Wipe every table. Test and reset use only.
    async fn delete_all_data(&self) -> Result<()>;
}

/// A store transaction used by the cron scheduler. Dropping it without
/// `commit` discards every change.
#[async_trait]
pub trait CronTransaction: Send {
    /// Create the job row if absent, with `last_ran_at` at the epoch.
    async fn create_cron_job(&mut self, name: &str) -> Result<()>;

    /// Read the job row and hold its lock until commit.
    async fn select_and_lock_cron_job(&mut self, name: &str) -> Result<CronJobInfo>;

    async fn update_cron_job_last_ran_at(&mut self, name: &str, at: DateTime<Utc>) -> Result<()>;

    async fn enqueue_work_item(&mut self, item: NewWorkItem) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
