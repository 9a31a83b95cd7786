//! Work item types and the enqueue builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::shard::{Shard, Sharding};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Work item ID. Monotonically increasing within a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub i64);

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queue key resolved to the shard that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueRef {
    pub name: String,
    pub shard: Shard,
}

impl QueueRef {
    pub fn new(name: impl Into<String>, sharding: &Sharding) -> Self {
        let name = name.into();
        let shard = sharding.shard_for(&name);
        Self { name, shard }
    }
}

impl std::fmt::Display for QueueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.shard)
    }
}

/// The queue a work item holds blocked while it is outstanding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocking {
    #[default]
    None,
    Queue(QueueRef),
}

impl Blocking {
    pub fn queue(&self) -> Option<&QueueRef> {
        match self {
            Blocking::None => None,
            Blocking::Queue(queue) => Some(queue),
        }
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A pending unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub shard: Shard,

    /// Target of the GET. Empty for placeholder items that only keep a
    /// paused or locked queue alive.
    pub url: String,

    pub queue_name: String,
    pub debug_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,

    /// Linked into its queue's FIFO chain.
    pub is_ingested: bool,

    /// Opaque payload passed through unmodified (e.g. trace context JSON).
    pub internal: Option<String>,

    pub blocking: Blocking,

    /// Lock applied to the queue when this item completes.
    pub external_lock_id_when_complete: Option<String>,
}

impl WorkItem {
    /// Placeholder items carry no URL and are completed without dispatch.
    pub fn is_noop(&self) -> bool {
        self.url.is_empty()
    }

    pub fn queue_ref(&self) -> QueueRef {
        QueueRef {
            name: self.queue_name.clone(),
            shard: self.shard,
        }
    }
}

/// Terminal record of a completed work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedWorkItem {
    pub item: WorkItem,
    pub completed_at: DateTime<Utc>,
}

/// What happened when work was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Created { id: WorkItemId, queue: QueueRef },
    /// An unattempted item with the same queue and URL already exists.
    Duplicate { existing: WorkItemId, queue: QueueRef },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new work items. The public API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    url: String,
    queue_name: Option<String>,
    debug_info: Option<String>,
    duplicate_protection: bool,
    internal: Option<String>,
    blocking_queue: Option<String>,
    lock_when_complete: Option<String>,
}

impl NewWorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue_name: None,
            debug_info: None,
            duplicate_protection: false,
            internal: None,
            blocking_queue: None,
            lock_when_complete: None,
        }
    }

    /// Queue key. Without one the item gets a fresh key of its own.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    pub fn debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }

    /// Skip the insert when an unattempted item with the same queue and URL
    /// already exists.
    pub fn duplicate_protection(mut self, enabled: bool) -> Self {
        self.duplicate_protection = enabled;
        self
    }

    pub fn internal(mut self, payload: impl Into<String>) -> Self {
        self.internal = Some(payload.into());
        self
    }

    /// Keep `queue` unclaimable until this item completes.
    pub fn blocks(mut self, queue: impl Into<String>) -> Self {
        self.blocking_queue = Some(queue.into());
        self
    }

    /// Take the external lock `lock_id` on this item's queue once it completes.
    pub fn lock_when_complete(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_when_complete = Some(lock_id.into());
        self
    }

    /// Resolve queue keys to shards and validate the blocking target.
    pub fn prepare(self, sharding: &Sharding) -> Result<PreparedWorkItem> {
        if self.url.is_empty() {
            return Err(Error::Other("work item url must not be empty".to_string()));
        }

        let queue_name = self
            .queue_name
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let blocking = match self.blocking_queue {
            None => Blocking::None,
            Some(target) if target == queue_name => {
                return Err(Error::InvalidBlockConfig(format!(
                    "queue {queue_name} cannot block itself"
                )));
            }
            Some(target) => Blocking::Queue(QueueRef::new(target, sharding)),
        };

        Ok(PreparedWorkItem {
            url: self.url,
            queue: QueueRef::new(queue_name, sharding),
            debug_info: self.debug_info,
            duplicate_protection: self.duplicate_protection,
            internal: self.internal,
            blocking,
            lock_when_complete: self.lock_when_complete,
        })
    }
}

/// A validated work item ready for insertion.
#[derive(Debug, Clone)]
pub struct PreparedWorkItem {
    pub url: String,
    pub queue: QueueRef,
    pub debug_info: Option<String>,
    pub duplicate_protection: bool,
    pub internal: Option<String>,
    pub blocking: Blocking,
    pub lock_when_complete: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unkeyed_items_get_distinct_queues() {
        let sharding = Sharding::single();
        let a = NewWorkItem::new("http://x/a").prepare(&sharding).unwrap();
        let b = NewWorkItem::new("http://x/a").prepare(&sharding).unwrap();
        assert_ne!(a.queue.name, b.queue.name);
    }

    #[test]
    fn self_block_is_rejected() {
        let result = NewWorkItem::new("http://x/a")
            .queue("q")
            .blocks("q")
            .prepare(&Sharding::single());
        assert!(matches!(result, Err(Error::InvalidBlockConfig(_))));
    }

    #[test]
    fn blocking_target_is_resolved_to_its_shard() {
        let sharding = Sharding::new(16).unwrap();
        let prepared = NewWorkItem::new("http://x/a")
            .queue("source")
            .blocks("a")
            .prepare(&sharding)
            .unwrap();
        let target = prepared.blocking.queue().unwrap();
        assert_eq!(target.name, "a");
        assert_eq!(target.shard, sharding.shard_for("a"));
    }
}
