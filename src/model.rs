//! Core data model.
//!
//! A work item is a URL to GET, filed under a queue key. The queue row holds
//! the FIFO lease state for that key; blocking messages carry blocking-set
//! changes between shards; cron jobs remember when they last fired.

pub mod cron_job;
pub mod queue;
pub mod work;

pub use cron_job::CronJobInfo;
pub use queue::{BlockToken, BlockingMessage, Queue};
pub use work::{
    Blocking, CompletedWorkItem, EnqueueResult, NewWorkItem, PreparedWorkItem, QueueRef, WorkItem,
    WorkItemId,
};
