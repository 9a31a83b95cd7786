//! Error types for hookq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// A work item may not block the queue it belongs to.
    #[error("invalid block configuration: {0}")]
    InvalidBlockConfig(String),

    #[error("work item {work_item_id} in queue {queue} completed while blocked")]
    BlockedItemCompleted { queue: String, work_item_id: i64 },

    #[error("queue {queue} already holds lock {held}, cannot apply {requested}")]
    LockConflict {
        queue: String,
        held: String,
        requested: String,
    },

    #[error("queue {queue} is already locked by {lock_id}")]
    AlreadyLocked { queue: String, lock_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cron error: {0}")]
    Cron(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
