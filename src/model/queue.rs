//! Queue lease state and the cross-shard blocking mailbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::work::{QueueRef, WorkItemId};
use crate::shard::Shard;
use crate::store::MAX_ERROR_COUNT;

/// Reference to an outstanding work item that holds a queue blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockToken {
    pub work_item_id: WorkItemId,
    pub shard: Shard,
}

/// FIFO lease state for one queue key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub shard: Shard,
    pub name: String,
    /// Head of the chain: the item handed out next.
    pub next_work_item_id: WorkItemId,
    pub error_count: i32,
    /// Lease or backoff deadline.
    pub locked_until: DateTime<Utc>,
    pub is_paused: bool,
    pub external_lock_id: Option<String>,
    pub blocked_by: Vec<BlockToken>,
}

impl Queue {
    /// Whether NextWorkItem may hand out this queue's head at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.locked_until < now
            && self.error_count < MAX_ERROR_COUNT
            && !self.is_paused
            && self.external_lock_id.is_none()
            && self.blocked_by.is_empty()
    }

    pub fn queue_ref(&self) -> QueueRef {
        QueueRef {
            name: self.name.clone(),
            shard: self.shard,
        }
    }
}

/// A pending change to a queue's blocking set, delivered through the target
/// shard's mailbox and applied on that shard's next poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingMessage {
    pub target: QueueRef,
    /// `true` adds `token` to the blocking set, `false` removes it.
    pub is_creating_block: bool,
    pub token: BlockToken,
}
