//! Queue-key sharding.
//!
//! Every WorkItem, Queue and BlockingMessage row carries its shard together
//! with the shard count it was written under, so a change of partition count
//! never reinterprets older rows.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on the partition count: one shard per MD5 nibble value.
pub const MAX_SHARD_COUNT: i16 = 16;

/// A single partition, identified together with the partition count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    pub index: i16,
    pub max_shards: i16,
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.max_shards)
    }
}

/// Deployment-wide partitioning scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharding {
    max_shards: i16,
}

impl Default for Sharding {
    fn default() -> Self {
        Self::single()
    }
}

impl Sharding {
    /// Unpartitioned deployment: everything lives on shard 0 of 1.
    pub fn single() -> Self {
        Self { max_shards: 1 }
    }

    pub fn new(max_shards: i16) -> Result<Self> {
        if !(1..=MAX_SHARD_COUNT).contains(&max_shards) {
            return Err(Error::Config(format!(
                "max shards must be between 1 and {MAX_SHARD_COUNT}, got {max_shards}"
            )));
        }
        Ok(Self { max_shards })
    }

    pub fn max_shards(&self) -> i16 {
        self.max_shards
    }

    /// Shard owning `queue_name`.
    pub fn shard_for(&self, queue_name: &str) -> Shard {
        let index = if self.max_shards == 1 {
            0
        } else {
            hash_nibble(queue_name) % self.max_shards
        };
        Shard {
            index,
            max_shards: self.max_shards,
        }
    }

    /// All shards of this deployment, in index order.
    pub fn shards(&self) -> impl Iterator<Item = Shard> + '_ {
        (0..self.max_shards).map(|index| Shard {
            index,
            max_shards: self.max_shards,
        })
    }
}

/// First nibble of the MD5 digest of the queue name (0..=15).
fn hash_nibble(queue_name: &str) -> i16 {
    let digest = Md5::digest(queue_name.as_bytes());
    (digest[0] >> 4) as i16
}
