//! # hookq
//!
//! Durable, HTTP-dispatching work queue.
//!
//! Callers enqueue a URL under a queue key; per-shard poll loops later GET
//! that URL and settle the item. At most one item per queue key is in
//! flight, and items of one key run in FIFO order. Queues can be paused,
//! externally locked, and blocked by outstanding items of other queues.
//! Cron jobs enqueue work on a schedule.
//!
//! Storage is pluggable behind [`store::WorkItemStore`]: Postgres via
//! [`db::Db`], or the in-process [`store::MemoryStore`].

pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod model;
pub mod shard;
pub mod store;
pub mod telemetry;
