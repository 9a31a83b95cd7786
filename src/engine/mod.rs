//! Poll loops driving the store: per-shard consumers, the cron worker and
//! the supervisor owning them.

pub mod consumer;
pub mod cron;
pub mod poll;
pub mod supervisor;

pub use consumer::WorkItemConsumer;
pub use cron::{CronJob, CronJobConfig, CronJobWorker, validate_cron_jobs};
pub use poll::{LoopState, PollLoop, PollWorker};
pub use supervisor::{Supervisor, SupervisorConfig};
