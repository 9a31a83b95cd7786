//! In-process store.
//!
//! Implements the full store contract without a database. Each shard's
//! state sits behind its own tokio mutex, which is the shard critical
//! section; blocking mailboxes are leaf locks that may be posted to while a
//! shard lock is held.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{
    COMPLETED_RETENTION, CronTransaction, FAILURE_BACKOFF, LEASE_DURATION, MAX_ERROR_COUNT,
    PURGE_BATCH_SIZE, QueueHealth, WorkItemStore,
};
use crate::error::{Error, Result};
use crate::model::*;
use crate::shard::{Shard, Sharding};

/// Store backed by process memory. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    sharding: Sharding,
    shards: HashMap<Shard, Mutex<ShardState>>,
    mailboxes: HashMap<Shard, StdMutex<VecDeque<BlockingMessage>>>,
    cron_jobs: Arc<Mutex<BTreeMap<String, CronJobInfo>>>,
    next_id: AtomicI64,
    clock_offset: StdMutex<TimeDelta>,
}

#[derive(Default)]
struct ShardState {
    items: BTreeMap<WorkItemId, WorkItem>,
    completed: Vec<CompletedWorkItem>,
    queues: HashMap<String, QueueRow>,
    /// Blocking sets by queue name. Kept apart from the queue rows so a block
    /// delivered before its target queue exists is not lost.
    blocked_by: HashMap<String, Vec<BlockToken>>,
}

struct QueueRow {
    next_work_item_id: WorkItemId,
    error_count: i32,
    locked_until: DateTime<Utc>,
    is_paused: bool,
    external_lock_id: Option<String>,
}

impl QueueRow {
    fn new(head: WorkItemId, locked_until: DateTime<Utc>) -> Self {
        Self {
            next_work_item_id: head,
            error_count: 0,
            locked_until,
            is_paused: false,
            external_lock_id: None,
        }
    }
}

impl ShardState {
    fn is_blocked(&self, queue_name: &str) -> bool {
        self.blocked_by
            .get(queue_name)
            .is_some_and(|tokens| !tokens.is_empty())
    }

    fn queue(&self, shard: Shard, name: &str) -> Option<Queue> {
        self.queues.get(name).map(|row| Queue {
            shard,
            name: name.to_string(),
            next_work_item_id: row.next_work_item_id,
            error_count: row.error_count,
            locked_until: row.locked_until,
            is_paused: row.is_paused,
            external_lock_id: row.external_lock_id.clone(),
            blocked_by: self.blocked_by.get(name).cloned().unwrap_or_default(),
        })
    }

    /// Link every unlinked item into its queue, creating queue rows that
    /// point at the oldest newly linked item.
    fn ingest(&mut self) {
        let mut heads: BTreeMap<String, (WorkItemId, DateTime<Utc>)> = BTreeMap::new();
        for item in self.items.values_mut().filter(|item| !item.is_ingested) {
            item.is_ingested = true;
            heads
                .entry(item.queue_name.clone())
                .or_insert((item.id, item.created_at));
        }
        for (name, (head, created_at)) in heads {
            self.queues
                .entry(name)
                .or_insert_with(|| QueueRow::new(head, created_at));
        }
    }

    fn apply_blocking_message(&mut self, message: BlockingMessage) {
        let tokens = self
            .blocked_by
            .entry(message.target.name.clone())
            .or_default();
        if message.is_creating_block {
            if !tokens.contains(&message.token) {
                tokens.push(message.token);
            }
        } else {
            tokens.retain(|token| *token != message.token);
            if tokens.is_empty() {
                self.blocked_by.remove(&message.target.name);
            }
        }
    }

    /// The queue whose head is `id`, if `id` is currently a queue head.
    fn queue_headed_by(&self, id: WorkItemId) -> Result<(String, &WorkItem)> {
        let item = self
            .items
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
        match self.queues.get(&item.queue_name) {
            Some(row) if row.next_work_item_id == id => Ok((item.queue_name.clone(), item)),
            _ => Err(Error::NotFound(format!(
                "work item {id} is not the head of queue {}",
                item.queue_name
            ))),
        }
    }
}

impl MemoryStore {
    pub fn new(sharding: Sharding) -> Self {
        let shards = sharding
            .shards()
            .map(|shard| (shard, Mutex::new(ShardState::default())))
            .collect();
        let mailboxes = sharding
            .shards()
            .map(|shard| (shard, StdMutex::new(VecDeque::new())))
            .collect();
        Self {
            inner: Arc::new(Inner {
                sharding,
                shards,
                mailboxes,
                cron_jobs: Arc::new(Mutex::new(BTreeMap::new())),
                next_id: AtomicI64::new(1),
                clock_offset: StdMutex::new(TimeDelta::zero()),
            }),
        }
    }

    /// Shift the store's clock forward. Lets tests expire leases and backoffs.
    pub fn advance_clock(&self, by: TimeDelta) {
        let mut offset = self
            .inner
            .clock_offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }

    /// Completed items of `shard`, in completion order.
    pub async fn completed_work_items(&self, shard: Shard) -> Result<Vec<CompletedWorkItem>> {
        Ok(self.shard(shard)?.lock().await.completed.clone())
    }

    fn now(&self) -> DateTime<Utc> {
        let offset = *self
            .inner
            .clock_offset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Utc::now() + offset
    }

    fn shard(&self, shard: Shard) -> Result<&Mutex<ShardState>> {
        self.inner
            .shards
            .get(&shard)
            .ok_or_else(|| Error::NotFound(format!("shard {shard}")))
    }

    fn post(&self, message: BlockingMessage) -> Result<()> {
        let mailbox = self
            .inner
            .mailboxes
            .get(&message.target.shard)
            .ok_or_else(|| Error::NotFound(format!("shard {}", message.target.shard)))?;
        mailbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(message);
        Ok(())
    }

    fn drain_mailbox(&self, shard: Shard) -> Result<Vec<BlockingMessage>> {
        let mailbox = self
            .inner
            .mailboxes
            .get(&shard)
            .ok_or_else(|| Error::NotFound(format!("shard {shard}")))?;
        Ok(mailbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect())
    }

    fn allocate_id(&self) -> WorkItemId {
        WorkItemId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn insert(&self, prepared: PreparedWorkItem) -> Result<EnqueueResult> {
        let now = self.now();
        let mut state = self.shard(prepared.queue.shard)?.lock().await;

        if prepared.duplicate_protection {
            let existing = state.items.values().find(|item| {
                item.queue_name == prepared.queue.name
                    && item.url == prepared.url
                    && item.last_attempted_at.is_none()
            });
            if let Some(existing) = existing {
                return Ok(EnqueueResult::Duplicate {
                    existing: existing.id,
                    queue: prepared.queue,
                });
            }
        }

        let id = self.allocate_id();
        if let Blocking::Queue(target) = &prepared.blocking {
            self.post(BlockingMessage {
                target: target.clone(),
                is_creating_block: true,
                token: BlockToken {
                    work_item_id: id,
                    shard: prepared.queue.shard,
                },
            })?;
        }
        state.items.insert(
            id,
            WorkItem {
                id,
                shard: prepared.queue.shard,
                url: prepared.url,
                queue_name: prepared.queue.name.clone(),
                debug_info: prepared.debug_info,
                created_at: now,
                last_attempted_at: None,
                is_ingested: false,
                internal: prepared.internal,
                blocking: prepared.blocking,
                external_lock_id_when_complete: prepared.lock_when_complete,
            },
        );

        Ok(EnqueueResult::Created {
            id,
            queue: prepared.queue,
        })
    }

    /// Add an already-linked no-op item that keeps a queue row alive.
    fn insert_placeholder(
        &self,
        state: &mut ShardState,
        queue: &QueueRef,
        blocking: Blocking,
        now: DateTime<Utc>,
    ) -> WorkItemId {
        let id = self.allocate_id();
        state.items.insert(
            id,
            WorkItem {
                id,
                shard: queue.shard,
                url: String::new(),
                queue_name: queue.name.clone(),
                debug_info: Some("placeholder".to_string()),
                created_at: now,
                last_attempted_at: None,
                is_ingested: true,
                internal: None,
                blocking,
                external_lock_id_when_complete: None,
            },
        );
        id
    }

    /// Ensure `queue` has a row, creating one headed by a placeholder, then
    /// apply `update` to it.
    async fn with_reserved_queue<F>(&self, queue: &QueueRef, update: F) -> Result<()>
    where
        F: FnOnce(&mut QueueRow) -> Result<()>,
    {
        let now = self.now();
        let mut state = self.shard(queue.shard)?.lock().await;
        if !state.queues.contains_key(&queue.name) {
            let head = self.insert_placeholder(&mut state, queue, Blocking::None, now);
            state
                .queues
                .insert(queue.name.clone(), QueueRow::new(head, now));
        }
        match state.queues.get_mut(&queue.name) {
            Some(row) => update(row),
            None => Err(Error::NotFound(format!("queue {queue}"))),
        }
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    fn sharding(&self) -> Sharding {
        self.inner.sharding
    }

    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult> {
        let prepared = item.prepare(&self.inner.sharding)?;
        self.insert(prepared).await
    }

    async fn next_work_item(&self, shard: Shard) -> Result<Option<WorkItem>> {
        let mut guard = self.shard(shard)?.lock().await;
        let state = &mut *guard;
        let now = self.now();

        state.ingest();
        for message in self.drain_mailbox(shard)? {
            state.apply_blocking_message(message);
        }

        let claimed = state
            .queues
            .iter()
            .filter(|(name, row)| {
                row.locked_until < now
                    && row.error_count < MAX_ERROR_COUNT
                    && !row.is_paused
                    && row.external_lock_id.is_none()
                    && !state.is_blocked(name)
            })
            .min_by_key(|(_, row)| (row.locked_until, row.next_work_item_id))
            .map(|(name, _)| name.clone());

        let Some(queue_name) = claimed else {
            return Ok(None);
        };
        let Some(row) = state.queues.get_mut(&queue_name) else {
            return Ok(None);
        };
        row.locked_until = now + LEASE_DURATION;
        let head = row.next_work_item_id;

        let item = state
            .items
            .get_mut(&head)
            .ok_or_else(|| Error::NotFound(format!("head {head} of queue {queue_name}")))?;
        item.last_attempted_at = Some(now);
        debug!(shard = %shard, queue = %queue_name, work_item_id = %head, "claimed work item");
        Ok(Some(item.clone()))
    }

    async fn complete_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut guard = self.shard(shard)?.lock().await;
        let state = &mut *guard;
        let now = self.now();

        let (queue_name, item) = state.queue_headed_by(id)?;
        let item = item.clone();
        if state.is_blocked(&queue_name) {
            return Err(Error::BlockedItemCompleted {
                queue: queue_name,
                work_item_id: id.0,
            });
        }
        let queue = item.queue_ref();

        let Some(row) = state.queues.get_mut(&queue_name) else {
            return Err(Error::NotFound(format!("queue {queue}")));
        };
        if let Some(lock) = &item.external_lock_id_when_complete {
            match &row.external_lock_id {
                Some(held) if held != lock => {
                    return Err(Error::LockConflict {
                        queue: queue_name,
                        held: held.clone(),
                        requested: lock.clone(),
                    });
                }
                _ => row.external_lock_id = Some(lock.clone()),
            }
        }
        let keep_alive = row.is_paused || row.external_lock_id.is_some();

        let next = state
            .items
            .values()
            .find(|other| other.queue_name == queue_name && other.is_ingested && other.id != id)
            .map(|other| (other.id, other.created_at));

        match next {
            Some((next_id, created_at)) => {
                if let Some(row) = state.queues.get_mut(&queue_name) {
                    row.next_work_item_id = next_id;
                    row.locked_until = created_at;
                    row.error_count = 0;
                }
            }
            None if keep_alive => {
                // The placeholder inherits the completed item's block so a
                // paused or locked queue keeps its downstream blocked.
                let placeholder = self.insert_placeholder(state, &queue, item.blocking.clone(), now);
                if let Blocking::Queue(target) = &item.blocking {
                    self.post(BlockingMessage {
                        target: target.clone(),
                        is_creating_block: true,
                        token: BlockToken {
                            work_item_id: placeholder,
                            shard,
                        },
                    })?;
                }
                if let Some(row) = state.queues.get_mut(&queue_name) {
                    row.next_work_item_id = placeholder;
                    row.locked_until = now;
                    row.error_count = 0;
                }
            }
            None => {
                state.queues.remove(&queue_name);
            }
        }

        state.items.remove(&id);
        if let Blocking::Queue(target) = &item.blocking {
            self.post(BlockingMessage {
                target: target.clone(),
                is_creating_block: false,
                token: BlockToken {
                    work_item_id: id,
                    shard,
                },
            })?;
        }
        state.completed.push(CompletedWorkItem {
            item,
            completed_at: now,
        });
        Ok(())
    }

    async fn fail_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut state = self.shard(shard)?.lock().await;
        let now = self.now();
        let (queue_name, _) = state.queue_headed_by(id)?;
        if let Some(row) = state.queues.get_mut(&queue_name) {
            row.error_count += 1;
            row.locked_until = now + FAILURE_BACKOFF;
        }
        Ok(())
    }

    async fn delay_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut state = self.shard(shard)?.lock().await;
        let now = self.now();
        let (queue_name, _) = state.queue_headed_by(id)?;
        if let Some(row) = state.queues.get_mut(&queue_name) {
            row.error_count = 0;
            row.locked_until = now;
        }
        Ok(())
    }

    async fn purge_work_items(&self, shard: Shard) -> Result<u64> {
        let mut state = self.shard(shard)?.lock().await;
        let cutoff = self.now() - COMPLETED_RETENTION;
        let mut removed = 0u64;
        state.completed.retain(|done| {
            if done.completed_at < cutoff && removed < PURGE_BATCH_SIZE as u64 {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn pause_queue(&self, queue: &QueueRef) -> Result<()> {
        self.with_reserved_queue(queue, |row| {
            row.is_paused = true;
            Ok(())
        })
        .await
    }

    async fn resume_queue(&self, queue: &QueueRef) -> Result<()> {
        let mut state = self.shard(queue.shard)?.lock().await;
        if let Some(row) = state.queues.get_mut(&queue.name) {
            row.is_paused = false;
        }
        Ok(())
    }

    async fn reset_queue(&self, queue: &QueueRef) -> Result<()> {
        let now = self.now();
        let mut state = self.shard(queue.shard)?.lock().await;
        if let Some(row) = state.queues.get_mut(&queue.name) {
            row.error_count = 0;
            row.locked_until = now;
        }
        Ok(())
    }

    async fn acquire_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()> {
        self.with_reserved_queue(queue, |row| match &row.external_lock_id {
            Some(held) => Err(Error::AlreadyLocked {
                queue: queue.name.clone(),
                lock_id: held.clone(),
            }),
            None => {
                row.external_lock_id = Some(lock_id.to_string());
                Ok(())
            }
        })
        .await
    }

    async fn release_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()> {
        let mut guard = self.shard(queue.shard)?.lock().await;
        let state = &mut *guard;
        let Some(row) = state.queues.get_mut(&queue.name) else {
            return Ok(());
        };
        if row.external_lock_id.as_deref() == Some(lock_id) {
            row.external_lock_id = None;
        } else if let Some(head) = state.items.get_mut(&row.next_work_item_id) {
            if head.external_lock_id_when_complete.as_deref() == Some(lock_id) {
                head.external_lock_id_when_complete = None;
            }
        }
        Ok(())
    }

    async fn queue_state(&self, queue: &QueueRef) -> Result<Option<Queue>> {
        let state = self.shard(queue.shard)?.lock().await;
        Ok(state.queue(queue.shard, &queue.name))
    }

    async fn pending_work_items(&self, queue: &QueueRef) -> Result<Vec<WorkItem>> {
        let state = self.shard(queue.shard)?.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| item.queue_name == queue.name)
            .cloned()
            .collect())
    }

    async fn get_cron_job_state(&self) -> Result<Vec<CronJobInfo>> {
        Ok(self.inner.cron_jobs.lock().await.values().cloned().collect())
    }

    async fn begin_cron_transaction(&self) -> Result<Box<dyn CronTransaction>> {
        let jobs = Arc::clone(&self.inner.cron_jobs).lock_owned().await;
        Ok(Box::new(MemoryCronTransaction {
            store: self.clone(),
            jobs,
            staged: BTreeMap::new(),
            items: Vec::new(),
        }))
    }

    async fn queue_health_check(&self) -> Result<QueueHealth> {
        let mut unhealthy = 0i64;
        for shard in self.inner.sharding.shards() {
            let state = self.shard(shard)?.lock().await;
            unhealthy += state
                .queues
                .values()
                .filter(|row| row.error_count >= MAX_ERROR_COUNT)
                .count() as i64;
        }
        Ok(QueueHealth::from_unhealthy_count(unhealthy))
    }

    async fn delete_all_data(&self) -> Result<()> {
        for shard in self.inner.sharding.shards() {
            *self.shard(shard)?.lock().await = ShardState::default();
            self.drain_mailbox(shard)?;
        }
        self.inner.cron_jobs.lock().await.clear();
        Ok(())
    }
}

/// Cron transaction over the in-memory job table. Holds the whole table
/// lock until commit or drop; changes are staged and applied on commit.
struct MemoryCronTransaction {
    store: MemoryStore,
    jobs: OwnedMutexGuard<BTreeMap<String, CronJobInfo>>,
    staged: BTreeMap<String, CronJobInfo>,
    items: Vec<PreparedWorkItem>,
}

impl MemoryCronTransaction {
    fn current(&self, name: &str) -> Option<&CronJobInfo> {
        self.staged.get(name).or_else(|| self.jobs.get(name))
    }
}

#[async_trait]
impl CronTransaction for MemoryCronTransaction {
    async fn create_cron_job(&mut self, name: &str) -> Result<()> {
        if self.current(name).is_none() {
            self.staged
                .insert(name.to_string(), CronJobInfo::never_ran(name));
        }
        Ok(())
    }

    async fn select_and_lock_cron_job(&mut self, name: &str) -> Result<CronJobInfo> {
        self.current(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cron job {name}")))
    }

    async fn update_cron_job_last_ran_at(&mut self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut job = self
            .current(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cron job {name}")))?;
        job.last_ran_at = at;
        self.staged.insert(name.to_string(), job);
        Ok(())
    }

    async fn enqueue_work_item(&mut self, item: NewWorkItem) -> Result<()> {
        let prepared = item.prepare(&self.store.inner.sharding)?;
        self.items.push(prepared);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryCronTransaction {
            store,
            mut jobs,
            staged,
            items,
        } = *self;
        for prepared in items {
            store.insert(prepared).await?;
        }
        jobs.extend(staged);
        Ok(())
    }
}
