//! Work item store over Postgres.
//!
//! Queue-touching operations run in a transaction holding the shard's
//! advisory lock. Enqueue and purge only insert or delete rows and take no
//! shard lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgConnection;

use super::Db;
use super::cron::PgCronTransaction;
use crate::error::{Error, Result};
use crate::model::*;
use crate::shard::{Shard, Sharding};
use crate::store::{
    COMPLETED_RETENTION, CronTransaction, FAILURE_BACKOFF, LEASE_DURATION, MAX_ERROR_COUNT,
    PURGE_BATCH_SIZE, QueueHealth, WorkItemStore,
};
use crate::telemetry::metrics;

const WORK_ITEM_COLUMNS: &str = "work_item_id, shard, max_shards, url, queue_name, debug_info, \
     created_at, last_attempted_at, is_ingested, internal, blocking_queue_name, \
     blocking_queue_shard, external_lock_id_when_complete";

fn record_operation(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}

/// Insert a prepared work item, honouring duplicate protection. Shared by
/// plain enqueue and the cron transaction.
pub(crate) async fn insert_work_item(
    conn: &mut PgConnection,
    prepared: PreparedWorkItem,
    now: DateTime<Utc>,
) -> Result<EnqueueResult> {
    let shard = prepared.queue.shard;

    if prepared.duplicate_protection {
        // Row lock excludes a concurrent claim; the predicate is re-checked
        // once the lock is granted.
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT work_item_id FROM work_item
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3 AND url = $4
             AND last_attempted_at IS NULL
             ORDER BY work_item_id
             LIMIT 1
             FOR UPDATE",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(&prepared.queue.name)
        .bind(&prepared.url)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((existing,)) = existing {
            metrics::work_enqueued().add(1, &[KeyValue::new("result", "duplicate")]);
            return Ok(EnqueueResult::Duplicate {
                existing: WorkItemId(existing),
                queue: prepared.queue,
            });
        }
    }

    let blocking_queue = prepared.blocking.queue();
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO work_item (shard, max_shards, url, queue_name, debug_info, created_at, internal, blocking_queue_name, blocking_queue_shard, external_lock_id_when_complete)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING work_item_id",
    )
    .bind(shard.index)
    .bind(shard.max_shards)
    .bind(&prepared.url)
    .bind(&prepared.queue.name)
    .bind(&prepared.debug_info)
    .bind(now)
    .bind(&prepared.internal)
    .bind(blocking_queue.map(|q| q.name.as_str()))
    .bind(blocking_queue.map(|q| q.shard.index))
    .bind(&prepared.lock_when_complete)
    .fetch_one(&mut *conn)
    .await?;

    if let Some(target) = blocking_queue {
        post_blocking_message(
            conn,
            target,
            true,
            BlockToken {
                work_item_id: WorkItemId(id),
                shard,
            },
        )
        .await?;
    }

    metrics::work_enqueued().add(1, &[KeyValue::new("result", "ok")]);
    Ok(EnqueueResult::Created {
        id: WorkItemId(id),
        queue: prepared.queue,
    })
}

async fn post_blocking_message(
    conn: &mut PgConnection,
    target: &QueueRef,
    is_creating_block: bool,
    token: BlockToken,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO blocking_message (queue_shard, queue_max_shards, queue_name, is_creating_block, blocking_work_item_id, blocking_shard, blocking_max_shards)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(target.shard.index)
    .bind(target.shard.max_shards)
    .bind(&target.name)
    .bind(is_creating_block)
    .bind(token.work_item_id.0)
    .bind(token.shard.index)
    .bind(token.shard.max_shards)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert an already-linked no-op item that keeps a queue row alive.
async fn insert_placeholder(
    conn: &mut PgConnection,
    queue: &QueueRef,
    blocking: &Blocking,
    now: DateTime<Utc>,
) -> Result<WorkItemId> {
    let blocking_queue = blocking.queue();
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO work_item (shard, max_shards, url, queue_name, debug_info, created_at, is_ingested, blocking_queue_name, blocking_queue_shard)
         VALUES ($1, $2, '', $3, 'placeholder', $4, TRUE, $5, $6)
         RETURNING work_item_id",
    )
    .bind(queue.shard.index)
    .bind(queue.shard.max_shards)
    .bind(&queue.name)
    .bind(now)
    .bind(blocking_queue.map(|q| q.name.as_str()))
    .bind(blocking_queue.map(|q| q.shard.index))
    .fetch_one(&mut *conn)
    .await?;
    Ok(WorkItemId(id))
}

/// Make sure `queue` has a row, creating one headed by a placeholder.
/// Returns the queue's current external lock.
async fn reserve_queue(
    conn: &mut PgConnection,
    queue: &QueueRef,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let existing: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT external_lock_id FROM queue
         WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
    )
    .bind(queue.shard.index)
    .bind(queue.shard.max_shards)
    .bind(&queue.name)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((lock,)) = existing {
        return Ok(lock);
    }

    let head = insert_placeholder(conn, queue, &Blocking::None, now).await?;
    sqlx::query(
        "INSERT INTO queue (shard, max_shards, queue_name, next_work_item_id, error_count, locked_until, is_paused)
         VALUES ($1, $2, $3, $4, 0, $5, FALSE)",
    )
    .bind(queue.shard.index)
    .bind(queue.shard.max_shards)
    .bind(&queue.name)
    .bind(head.0)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(None)
}

/// Link unlinked items of `shard` into their queues. The UPDATE and the
/// queue INSERT are one statement so a concurrent enqueue is either linked
/// with a queue row or left for the next poll.
async fn ingest(conn: &mut PgConnection, shard: Shard) -> Result<()> {
    sqlx::query(
        "WITH linked AS (
             UPDATE work_item SET is_ingested = TRUE
             WHERE shard = $1 AND max_shards = $2 AND NOT is_ingested
             RETURNING queue_name, work_item_id, created_at
         )
         INSERT INTO queue (shard, max_shards, queue_name, next_work_item_id, error_count, locked_until, is_paused)
         SELECT DISTINCT ON (queue_name) $1, $2, queue_name, work_item_id, 0, created_at, FALSE
         FROM linked
         ORDER BY queue_name, work_item_id
         ON CONFLICT (shard, max_shards, queue_name) DO NOTHING",
    )
    .bind(shard.index)
    .bind(shard.max_shards)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drain `shard`'s blocking mailbox and apply it in insertion order.
async fn apply_blocking_messages(conn: &mut PgConnection, shard: Shard) -> Result<()> {
    let mut messages: Vec<BlockingMessageRow> = sqlx::query_as(
        "DELETE FROM blocking_message
         WHERE queue_shard = $1 AND queue_max_shards = $2
         RETURNING blocking_message_id, queue_name, is_creating_block, blocking_work_item_id, blocking_shard, blocking_max_shards",
    )
    .bind(shard.index)
    .bind(shard.max_shards)
    .fetch_all(&mut *conn)
    .await?;
    messages.sort_by_key(|m| m.blocking_message_id);

    for message in messages {
        let sql = if message.is_creating_block {
            "INSERT INTO queue_blocked_by (shard, max_shards, queue_name, blocking_work_item_id, blocking_shard, blocking_max_shards)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT DO NOTHING"
        } else {
            "DELETE FROM queue_blocked_by
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3
             AND blocking_work_item_id = $4 AND blocking_shard = $5 AND blocking_max_shards = $6"
        };
        sqlx::query(sql)
            .bind(shard.index)
            .bind(shard.max_shards)
            .bind(&message.queue_name)
            .bind(message.blocking_work_item_id)
            .bind(message.blocking_shard)
            .bind(message.blocking_max_shards)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn is_blocked(conn: &mut PgConnection, queue: &QueueRef) -> Result<bool> {
    let (blocked,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (
             SELECT 1 FROM queue_blocked_by
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3
         )",
    )
    .bind(queue.shard.index)
    .bind(queue.shard.max_shards)
    .bind(&queue.name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(blocked)
}

async fn fetch_work_item(
    conn: &mut PgConnection,
    id: WorkItemId,
    shard: Shard,
) -> Result<WorkItem> {
    let sql = format!(
        "SELECT {WORK_ITEM_COLUMNS} FROM work_item
         WHERE work_item_id = $1 AND shard = $2 AND max_shards = $3"
    );
    let row: Option<WorkItemRow> = sqlx::query_as(&sql)
        .bind(id.0)
        .bind(shard.index)
        .bind(shard.max_shards)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(WorkItem::from)
        .ok_or_else(|| Error::NotFound(format!("work item {id} on shard {shard}")))
}

impl Db {
    /// Completed items of `shard`, in completion order.
    pub async fn completed_work_items(&self, shard: Shard) -> Result<Vec<CompletedWorkItem>> {
        let _permit = self.acquire().await?;
        let rows: Vec<CompletedRow> = sqlx::query_as(&format!(
            "SELECT {WORK_ITEM_COLUMNS}, completed_at FROM work_item_completed
             WHERE shard = $1 AND max_shards = $2
             ORDER BY completed_at, work_item_id"
        ))
        .bind(shard.index)
        .bind(shard.max_shards)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| CompletedWorkItem {
                item: row.item.into(),
                completed_at: row.completed_at,
            })
            .collect())
    }
}

#[async_trait]
impl WorkItemStore for Db {
    fn sharding(&self) -> Sharding {
        self.sharding
    }

    async fn enqueue(&self, item: NewWorkItem) -> Result<EnqueueResult> {
        let prepared = item.prepare(&self.sharding)?;
        let mut shard_tx = self.begin().await?;
        let result = insert_work_item(&mut shard_tx.tx, prepared, Utc::now()).await?;
        shard_tx.commit().await?;
        Ok(result)
    }

    async fn next_work_item(&self, shard: Shard) -> Result<Option<WorkItem>> {
        let mut shard_tx = self.begin_shard(shard).await?;
        let conn = &mut *shard_tx.tx;
        let now = Utc::now();

        ingest(conn, shard).await?;
        apply_blocking_messages(conn, shard).await?;

        let candidate: Option<(String, i64)> = sqlx::query_as(
            "SELECT q.queue_name, q.next_work_item_id FROM queue q
             WHERE q.shard = $1 AND q.max_shards = $2
             AND q.locked_until < $3
             AND q.error_count < $4
             AND NOT q.is_paused
             AND q.external_lock_id IS NULL
             AND NOT EXISTS (
                 SELECT 1 FROM queue_blocked_by b
                 WHERE b.shard = q.shard AND b.max_shards = q.max_shards AND b.queue_name = q.queue_name
             )
             ORDER BY q.locked_until, q.next_work_item_id
             LIMIT 1",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(now)
        .bind(MAX_ERROR_COUNT)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((queue_name, head)) = candidate else {
            shard_tx.commit().await?;
            record_operation("claim_empty");
            return Ok(None);
        };

        sqlx::query(
            "UPDATE queue SET locked_until = $4
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(&queue_name)
        .bind(now + LEASE_DURATION)
        .execute(&mut *conn)
        .await?;

        let sql = format!(
            "UPDATE work_item SET last_attempted_at = $2
             WHERE work_item_id = $1
             RETURNING {WORK_ITEM_COLUMNS}"
        );
        let row: WorkItemRow = sqlx::query_as(&sql)
            .bind(head)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;

        shard_tx.commit().await?;
        record_operation("claim");
        Ok(Some(row.into()))
    }

    async fn complete_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut shard_tx = self.begin_shard(shard).await?;
        let conn = &mut *shard_tx.tx;
        let now = Utc::now();

        let item = fetch_work_item(conn, id, shard).await?;
        let queue = item.queue_ref();

        let row: Option<(i64, bool, Option<String>)> = sqlx::query_as(
            "SELECT next_work_item_id, is_paused, external_lock_id FROM queue
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(&queue.name)
        .fetch_optional(&mut *conn)
        .await?;
        let (is_paused, mut external_lock) = match row {
            Some((head, is_paused, lock)) if head == id.0 => (is_paused, lock),
            _ => {
                return Err(Error::NotFound(format!(
                    "work item {id} is not the head of queue {queue}"
                )));
            }
        };

        if is_blocked(conn, &queue).await? {
            return Err(Error::BlockedItemCompleted {
                queue: queue.name,
                work_item_id: id.0,
            });
        }

        if let Some(lock) = &item.external_lock_id_when_complete {
            if let Some(held) = external_lock.as_ref().filter(|held| *held != lock) {
                return Err(Error::LockConflict {
                    queue: queue.name,
                    held: held.clone(),
                    requested: lock.clone(),
                });
            }
            sqlx::query(
                "UPDATE queue SET external_lock_id = $4
                 WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
            )
            .bind(shard.index)
            .bind(shard.max_shards)
            .bind(&queue.name)
            .bind(lock)
            .execute(&mut *conn)
            .await?;
            external_lock = Some(lock.clone());
        }

        let next: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT work_item_id, created_at FROM work_item
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3
             AND is_ingested AND work_item_id <> $4
             ORDER BY work_item_id
             LIMIT 1",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(&queue.name)
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;

        let advance_to = match next {
            Some((next_id, created_at)) => Some((next_id, created_at)),
            None if is_paused || external_lock.is_some() => {
                // The placeholder inherits the completed item's block so a
                // paused or locked queue keeps its downstream blocked.
                let placeholder = insert_placeholder(conn, &queue, &item.blocking, now).await?;
                if let Some(target) = item.blocking.queue() {
                    post_blocking_message(
                        conn,
                        target,
                        true,
                        BlockToken {
                            work_item_id: placeholder,
                            shard,
                        },
                    )
                    .await?;
                }
                Some((placeholder.0, now))
            }
            None => None,
        };

        match advance_to {
            Some((head, locked_until)) => {
                sqlx::query(
                    "UPDATE queue SET next_work_item_id = $4, locked_until = $5, error_count = 0
                     WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
                )
                .bind(shard.index)
                .bind(shard.max_shards)
                .bind(&queue.name)
                .bind(head)
                .bind(locked_until)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    "DELETE FROM queue WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
                )
                .bind(shard.index)
                .bind(shard.max_shards)
                .bind(&queue.name)
                .execute(&mut *conn)
                .await?;
            }
        }

        let sql = format!(
            "WITH moved AS (
                 DELETE FROM work_item WHERE work_item_id = $1
                 RETURNING {WORK_ITEM_COLUMNS}
             )
             INSERT INTO work_item_completed ({WORK_ITEM_COLUMNS}, completed_at)
             SELECT {WORK_ITEM_COLUMNS}, $2 FROM moved"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .bind(now)
            .execute(&mut *conn)
            .await?;

        if let Some(target) = item.blocking.queue() {
            post_blocking_message(
                conn,
                target,
                false,
                BlockToken {
                    work_item_id: id,
                    shard,
                },
            )
            .await?;
        }

        shard_tx.commit().await?;
        record_operation("complete");
        Ok(())
    }

    async fn fail_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut shard_tx = self.begin_shard(shard).await?;
        let updated = sqlx::query(
            "UPDATE queue SET error_count = error_count + 1, locked_until = $4
             WHERE shard = $1 AND max_shards = $2 AND next_work_item_id = $3",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(id.0)
        .bind(Utc::now() + FAILURE_BACKOFF)
        .execute(&mut *shard_tx.tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("queue headed by work item {id}")));
        }
        shard_tx.commit().await?;
        record_operation("fail");
        Ok(())
    }

    async fn delay_work_item(&self, id: WorkItemId, shard: Shard) -> Result<()> {
        let mut shard_tx = self.begin_shard(shard).await?;
        let updated = sqlx::query(
            "UPDATE queue SET error_count = 0, locked_until = $4
             WHERE shard = $1 AND max_shards = $2 AND next_work_item_id = $3",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(id.0)
        .bind(Utc::now())
        .execute(&mut *shard_tx.tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("queue headed by work item {id}")));
        }
        shard_tx.commit().await?;
        record_operation("delay");
        Ok(())
    }

    async fn purge_work_items(&self, shard: Shard) -> Result<u64> {
        let _permit = self.acquire().await?;
        let removed = sqlx::query(
            "DELETE FROM work_item_completed
             WHERE work_item_id IN (
                 SELECT work_item_id FROM work_item_completed
                 WHERE shard = $1 AND max_shards = $2 AND completed_at < $3
                 ORDER BY completed_at
                 LIMIT $4
             )",
        )
        .bind(shard.index)
        .bind(shard.max_shards)
        .bind(Utc::now() - COMPLETED_RETENTION)
        .bind(PURGE_BATCH_SIZE)
        .execute(&self.pool)
        .await?
        .rows_affected();
        record_operation("purge");
        Ok(removed)
    }

    async fn pause_queue(&self, queue: &QueueRef) -> Result<()> {
        let mut shard_tx = self.begin_shard(queue.shard).await?;
        reserve_queue(&mut shard_tx.tx, queue, Utc::now()).await?;
        sqlx::query(
            "UPDATE queue SET is_paused = TRUE
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .execute(&mut *shard_tx.tx)
        .await?;
        shard_tx.commit().await?;
        record_operation("pause");
        Ok(())
    }

    async fn resume_queue(&self, queue: &QueueRef) -> Result<()> {
        let mut shard_tx = self.begin_shard(queue.shard).await?;
        sqlx::query(
            "UPDATE queue SET is_paused = FALSE
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .execute(&mut *shard_tx.tx)
        .await?;
        shard_tx.commit().await?;
        record_operation("resume");
        Ok(())
    }

    async fn reset_queue(&self, queue: &QueueRef) -> Result<()> {
        let mut shard_tx = self.begin_shard(queue.shard).await?;
        sqlx::query(
            "UPDATE queue SET error_count = 0, locked_until = $4
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .bind(Utc::now())
        .execute(&mut *shard_tx.tx)
        .await?;
        shard_tx.commit().await?;
        record_operation("reset");
        Ok(())
    }

    async fn acquire_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()> {
        let mut shard_tx = self.begin_shard(queue.shard).await?;
        if let Some(held) = reserve_queue(&mut shard_tx.tx, queue, Utc::now()).await? {
            return Err(Error::AlreadyLocked {
                queue: queue.name.clone(),
                lock_id: held,
            });
        }
        sqlx::query(
            "UPDATE queue SET external_lock_id = $4
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .bind(lock_id)
        .execute(&mut *shard_tx.tx)
        .await?;
        shard_tx.commit().await?;
        record_operation("lock");
        Ok(())
    }

    async fn release_external_lock(&self, queue: &QueueRef, lock_id: &str) -> Result<()> {
        let mut shard_tx = self.begin_shard(queue.shard).await?;
        let conn = &mut *shard_tx.tx;

        let row: Option<(i64, Option<String>)> = sqlx::query_as(
            "SELECT next_work_item_id, external_lock_id FROM queue
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((head, held)) = row else {
            return Ok(());
        };

        if held.as_deref() == Some(lock_id) {
            sqlx::query(
                "UPDATE queue SET external_lock_id = NULL
                 WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
            )
            .bind(queue.shard.index)
            .bind(queue.shard.max_shards)
            .bind(&queue.name)
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query(
                "UPDATE work_item SET external_lock_id_when_complete = NULL
                 WHERE work_item_id = $1 AND external_lock_id_when_complete = $2",
            )
            .bind(head)
            .bind(lock_id)
            .execute(&mut *conn)
            .await?;
        }

        shard_tx.commit().await?;
        record_operation("unlock");
        Ok(())
    }

    async fn queue_state(&self, queue: &QueueRef) -> Result<Option<Queue>> {
        let _permit = self.acquire().await?;
        let row: Option<QueueRow> = sqlx::query_as(
            "SELECT next_work_item_id, error_count, locked_until, is_paused, external_lock_id FROM queue
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let blocked_by: Vec<(i64, i16, i16)> = sqlx::query_as(
            "SELECT blocking_work_item_id, blocking_shard, blocking_max_shards FROM queue_blocked_by
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3
             ORDER BY blocking_work_item_id",
        )
        .bind(queue.shard.index)
        .bind(queue.shard.max_shards)
        .bind(&queue.name)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Queue {
            shard: queue.shard,
            name: queue.name.clone(),
            next_work_item_id: WorkItemId(row.next_work_item_id),
            error_count: row.error_count,
            locked_until: row.locked_until,
            is_paused: row.is_paused,
            external_lock_id: row.external_lock_id,
            blocked_by: blocked_by
                .into_iter()
                .map(|(id, index, max_shards)| BlockToken {
                    work_item_id: WorkItemId(id),
                    shard: Shard { index, max_shards },
                })
                .collect(),
        }))
    }

    async fn pending_work_items(&self, queue: &QueueRef) -> Result<Vec<WorkItem>> {
        let _permit = self.acquire().await?;
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_item
             WHERE shard = $1 AND max_shards = $2 AND queue_name = $3
             ORDER BY work_item_id"
        );
        let rows: Vec<WorkItemRow> = sqlx::query_as(&sql)
            .bind(queue.shard.index)
            .bind(queue.shard.max_shards)
            .bind(&queue.name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(WorkItem::from).collect())
    }

    async fn get_cron_job_state(&self) -> Result<Vec<CronJobInfo>> {
        let _permit = self.acquire().await?;
        let rows: Vec<(String, DateTime<Utc>, bool)> = sqlx::query_as(
            "SELECT cron_job_name, last_ran_at, active FROM cron_job ORDER BY cron_job_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_ran_at, active)| CronJobInfo {
                name,
                last_ran_at,
                active,
            })
            .collect())
    }

    async fn begin_cron_transaction(&self) -> Result<Box<dyn CronTransaction>> {
        let shard_tx = self.begin().await?;
        Ok(Box::new(PgCronTransaction::new(shard_tx, self.sharding)))
    }

    async fn queue_health_check(&self) -> Result<QueueHealth> {
        let _permit = self.acquire().await?;
        let (unhealthy,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue WHERE error_count >= $1")
                .bind(MAX_ERROR_COUNT)
                .fetch_one(&self.pool)
                .await?;
        Ok(QueueHealth::from_unhealthy_count(unhealthy))
    }

    async fn delete_all_data(&self) -> Result<()> {
        let _permit = self.acquire().await?;
        sqlx::query(
            "TRUNCATE work_item, work_item_completed, queue, queue_blocked_by, blocking_message, cron_job",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    work_item_id: i64,
    shard: i16,
    max_shards: i16,
    url: String,
    queue_name: String,
    debug_info: Option<String>,
    created_at: DateTime<Utc>,
    last_attempted_at: Option<DateTime<Utc>>,
    is_ingested: bool,
    internal: Option<String>,
    blocking_queue_name: Option<String>,
    blocking_queue_shard: Option<i16>,
    external_lock_id_when_complete: Option<String>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        let shard = Shard {
            index: row.shard,
            max_shards: row.max_shards,
        };
        let blocking = match (row.blocking_queue_name, row.blocking_queue_shard) {
            (Some(name), Some(index)) => Blocking::Queue(QueueRef {
                name,
                shard: Shard {
                    index,
                    max_shards: row.max_shards,
                },
            }),
            _ => Blocking::None,
        };
        Self {
            id: WorkItemId(row.work_item_id),
            shard,
            url: row.url,
            queue_name: row.queue_name,
            debug_info: row.debug_info,
            created_at: row.created_at,
            last_attempted_at: row.last_attempted_at,
            is_ingested: row.is_ingested,
            internal: row.internal,
            blocking,
            external_lock_id_when_complete: row.external_lock_id_when_complete,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CompletedRow {
    #[sqlx(flatten)]
    item: WorkItemRow,
    completed_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    next_work_item_id: i64,
    error_count: i32,
    locked_until: DateTime<Utc>,
    is_paused: bool,
    external_lock_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct BlockingMessageRow {
    blocking_message_id: i64,
    queue_name: String,
    is_creating_block: bool,
    blocking_work_item_id: i64,
    blocking_shard: i16,
    blocking_max_shards: i16,
}
