//! Store contract tests against the in-process store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeDelta;
use hookq::error::Error;
use hookq::model::{EnqueueResult, NewWorkItem, QueueRef, WorkItemId};
use hookq::shard::{Shard, Sharding};
use hookq::store::{MAX_ERROR_COUNT, MemoryStore, WorkItemStore};
use tokio::sync::Mutex;

fn store() -> MemoryStore {
    MemoryStore::new(Sharding::single())
}

fn shard0() -> Shard {
    Sharding::single().shard_for("")
}

fn queue(store: &MemoryStore, name: &str) -> QueueRef {
    QueueRef::new(name, &store.sharding())
}

async fn enqueue(store: &MemoryStore, queue: &str, url: &str) -> WorkItemId {
    match store
        .enqueue(NewWorkItem::new(url).queue(queue))
        .await
        .unwrap()
    {
        EnqueueResult::Created { id, .. } => id,
        other => panic!("expected Created, got {other:?}"),
    }
}

/// Claim and complete everything claimable, returning the URLs of real
/// (non-placeholder) items in completion order.
async fn drain(store: &MemoryStore) -> Vec<String> {
    let mut urls = Vec::new();
    for shard in store.sharding().shards() {
        while let Some(item) = store.next_work_item(shard).await.unwrap() {
            store.complete_work_item(item.id, shard).await.unwrap();
            if !item.is_noop() {
                urls.push(item.url);
            }
        }
    }
    urls
}

// ---------------------------------------------------------------------------
// Ordering and leasing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn items_of_one_queue_complete_in_fifo_order() {
    let store = store();
    for i in 0..5 {
        enqueue(&store, "fifo", &format!("http://t/{i}")).await;
    }

    let urls = drain(&store).await;
    let expected: Vec<String> = (0..5).map(|i| format!("http://t/{i}")).collect();
    assert_eq!(urls, expected);
    assert!(store.queue_state(&queue(&store, "fifo")).await.unwrap().is_none());
}

#[tokio::test]
async fn at_most_one_item_per_queue_is_in_flight() {
    let store = store();
    let first = enqueue(&store, "q", "http://t/1").await;
    enqueue(&store, "q", "http://t/2").await;

    let claimed = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert!(claimed.last_attempted_at.is_some());
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());

    // The lease expires after an hour; the same head is handed out again.
    store.advance_clock(TimeDelta::minutes(61));
    let reclaimed = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, first);
}

#[tokio::test]
async fn independent_queues_are_served_longest_waiting_first() {
    let store = store();
    enqueue(&store, "a", "http://t/a1").await;
    enqueue(&store, "b", "http://t/b1").await;
    enqueue(&store, "a", "http://t/a2").await;

    let first = store.next_work_item(shard0()).await.unwrap().unwrap();
    let second = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(first.url, "http://t/a1");
    assert_eq!(second.url, "http://t/b1");
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());
}

#[tokio::test]
async fn unkeyed_items_get_their_own_queues() {
    let store = store();
    store.enqueue(NewWorkItem::new("http://t/1")).await.unwrap();
    store.enqueue(NewWorkItem::new("http://t/2")).await.unwrap();

    let a = store.next_work_item(shard0()).await.unwrap().unwrap();
    let b = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_ne!(a.queue_name, b.queue_name);
}

#[tokio::test]
async fn concurrent_consumers_preserve_per_queue_order() {
    let store = MemoryStore::new(Sharding::new(4).unwrap());
    let mut expected: HashMap<String, Vec<i64>> = HashMap::new();
    for i in 0..60 {
        let name = format!("q{}", i % 6);
        let id = enqueue(&store, &name, &format!("http://t/{i}")).await;
        expected.entry(name).or_default().push(id.0);
    }

    let seen: Arc<Mutex<HashMap<String, Vec<i64>>>> = Arc::default();
    let mut tasks = Vec::new();
    for shard in store.sharding().shards() {
        for _ in 0..3 {
            let store = store.clone();
            let seen = Arc::clone(&seen);
            tasks.push(tokio::spawn(async move {
                while let Some(item) = store.next_work_item(shard).await.unwrap() {
                    seen.lock()
                        .await
                        .entry(item.queue_name.clone())
                        .or_default()
                        .push(item.id.0);
                    tokio::task::yield_now().await;
                    store.complete_work_item(item.id, shard).await.unwrap();
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*seen.lock().await, expected);
}

// ---------------------------------------------------------------------------
// Failure, delay, purge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failures_back_off_and_trip_the_breaker() {
    let store = store();
    let id = enqueue(&store, "flaky", "http://t/flaky").await;
    let q = queue(&store, "flaky");

    for k in 1..=MAX_ERROR_COUNT {
        let item = store.next_work_item(shard0()).await.unwrap().unwrap();
        assert_eq!(item.id, id);
        store.fail_work_item(id, shard0()).await.unwrap();
        assert_eq!(store.queue_state(&q).await.unwrap().unwrap().error_count, k);

        // Backed off for five minutes.
        store.advance_clock(TimeDelta::minutes(4));
        if k < MAX_ERROR_COUNT {
            assert!(store.next_work_item(shard0()).await.unwrap().is_none());
        }
        store.advance_clock(TimeDelta::minutes(2));
    }

    assert!(store.next_work_item(shard0()).await.unwrap().is_none());
    let health = store.queue_health_check().await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.unhealthy_queues, 1);
}

#[tokio::test]
async fn reset_reopens_a_tripped_queue() {
    let store = store();
    let id = enqueue(&store, "tripped", "http://t/tripped").await;
    let q = queue(&store, "tripped");

    for _ in 0..MAX_ERROR_COUNT {
        store.next_work_item(shard0()).await.unwrap().unwrap();
        store.fail_work_item(id, shard0()).await.unwrap();
        store.advance_clock(TimeDelta::minutes(6));
    }
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());
    assert!(!store.queue_health_check().await.unwrap().healthy);

    store.reset_queue(&q).await.unwrap();
    assert_eq!(store.queue_state(&q).await.unwrap().unwrap().error_count, 0);
    assert!(store.queue_health_check().await.unwrap().healthy);
    store.advance_clock(TimeDelta::milliseconds(1));
    let item = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(item.id, id);

    // Resetting a queue that does not exist changes nothing.
    store.reset_queue(&queue(&store, "absent")).await.unwrap();
    assert!(store.queue_state(&queue(&store, "absent")).await.unwrap().is_none());
}

#[tokio::test]
async fn delay_releases_without_counting_an_error() {
    let store = store();
    let id = enqueue(&store, "busy", "http://t/busy").await;
    let q = queue(&store, "busy");

    store.next_work_item(shard0()).await.unwrap().unwrap();
    store.fail_work_item(id, shard0()).await.unwrap();
    store.advance_clock(TimeDelta::minutes(6));
    store.next_work_item(shard0()).await.unwrap().unwrap();
    store.delay_work_item(id, shard0()).await.unwrap();

    let state = store.queue_state(&q).await.unwrap().unwrap();
    assert_eq!(state.error_count, 0);
    store.advance_clock(TimeDelta::milliseconds(1));
    let again = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(again.id, id);
}

#[tokio::test]
async fn completing_advances_and_resets_errors() {
    let store = store();
    let first = enqueue(&store, "q", "http://t/1").await;
    let second = enqueue(&store, "q", "http://t/2").await;
    let q = queue(&store, "q");

    store.next_work_item(shard0()).await.unwrap();
    store.fail_work_item(first, shard0()).await.unwrap();
    store.advance_clock(TimeDelta::minutes(6));
    store.next_work_item(shard0()).await.unwrap();
    store.complete_work_item(first, shard0()).await.unwrap();

    let state = store.queue_state(&q).await.unwrap().unwrap();
    assert_eq!(state.next_work_item_id, second);
    assert_eq!(state.error_count, 0);
}

#[tokio::test]
async fn purge_removes_only_expired_history() {
    let store = store();
    enqueue(&store, "q", "http://t/old").await;
    drain(&store).await;

    store.advance_clock(TimeDelta::days(15));
    enqueue(&store, "q", "http://t/new").await;
    drain(&store).await;

    assert_eq!(store.purge_work_items(shard0()).await.unwrap(), 1);
    assert_eq!(store.purge_work_items(shard0()).await.unwrap(), 0);
    let left = store.completed_work_items(shard0()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].item.url, "http://t/new");
}

// ---------------------------------------------------------------------------
// Duplicate protection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_protection_keeps_one_unattempted_item() {
    let store = store();
    let item = || {
        NewWorkItem::new("http://t/sync")
            .queue("sync")
            .duplicate_protection(true)
    };

    let first = store.enqueue(item()).await.unwrap();
    let second = store.enqueue(item()).await.unwrap();
    let EnqueueResult::Created { id, .. } = first else {
        panic!("expected Created, got {first:?}");
    };
    assert!(matches!(second, EnqueueResult::Duplicate { existing, .. } if existing == id));
    assert_eq!(
        store.pending_work_items(&queue(&store, "sync")).await.unwrap().len(),
        1
    );

    // Once attempted, the same URL may be queued again.
    store.next_work_item(shard0()).await.unwrap().unwrap();
    let third = store.enqueue(item()).await.unwrap();
    assert!(matches!(third, EnqueueResult::Created { .. }));

    // Without protection duplicates are stored.
    store
        .enqueue(NewWorkItem::new("http://t/sync").queue("sync"))
        .await
        .unwrap();
    assert_eq!(
        store.pending_work_items(&queue(&store, "sync")).await.unwrap().len(),
        3
    );
}

// ---------------------------------------------------------------------------
// Pause
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pausing_an_unused_queue_reserves_it() {
    let store = store();
    let q = queue(&store, "q");
    store.pause_queue(&q).await.unwrap();
    store.pause_queue(&q).await.unwrap();
    enqueue(&store, "q", "http://t/1").await;

    assert!(drain(&store).await.is_empty());
    let state = store.queue_state(&q).await.unwrap().unwrap();
    assert!(state.is_paused);

    let pending = store.pending_work_items(&q).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].is_noop());
    assert_eq!(pending[1].url, "http://t/1");

    // Resuming hands out the placeholder first, then the real item.
    store.resume_queue(&q).await.unwrap();
    let placeholder = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert!(placeholder.is_noop());
    store.complete_work_item(placeholder.id, shard0()).await.unwrap();
    assert_eq!(drain(&store).await, vec!["http://t/1".to_string()]);
    assert!(store.queue_state(&q).await.unwrap().is_none());
}

#[tokio::test]
async fn paused_queue_survives_completion_of_its_head() {
    let store = store();
    let id = enqueue(&store, "q", "http://t/1").await;
    let q = queue(&store, "q");

    store.next_work_item(shard0()).await.unwrap().unwrap();
    store.pause_queue(&q).await.unwrap();
    store.complete_work_item(id, shard0()).await.unwrap();

    let state = store.queue_state(&q).await.unwrap().unwrap();
    assert!(state.is_paused);
    assert_ne!(state.next_work_item_id, id);
    assert!(store.pending_work_items(&q).await.unwrap()[0].is_noop());
}

// ---------------------------------------------------------------------------
// External locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn external_locks_are_exclusive() {
    let store = store();
    let q = queue(&store, "locked");
    enqueue(&store, "locked", "http://t/1").await;

    store.acquire_external_lock(&q, "holder-a").await.unwrap();
    let err = store.acquire_external_lock(&q, "holder-b").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyLocked { .. }));
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());

    // Mismatched release is a no-op.
    store.release_external_lock(&q, "holder-b").await.unwrap();
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());

    store.release_external_lock(&q, "holder-a").await.unwrap();
    assert_eq!(drain(&store).await, vec!["http://t/1".to_string()]);
}

#[tokio::test]
async fn releasing_an_absent_lock_is_a_no_op() {
    let store = store();
    store
        .release_external_lock(&queue(&store, "nowhere"), "x")
        .await
        .unwrap();
}

#[tokio::test]
async fn lock_when_complete_applies_on_completion() {
    let store = store();
    let q = queue(&store, "q");
    store
        .enqueue(NewWorkItem::new("http://t/1").queue("q").lock_when_complete("L"))
        .await
        .unwrap();
    enqueue(&store, "q", "http://t/2").await;

    let item = store.next_work_item(shard0()).await.unwrap().unwrap();
    store.complete_work_item(item.id, shard0()).await.unwrap();
    let state = store.queue_state(&q).await.unwrap().unwrap();
    assert_eq!(state.external_lock_id.as_deref(), Some("L"));
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());

    store.release_external_lock(&q, "L").await.unwrap();
    assert_eq!(drain(&store).await, vec!["http://t/2".to_string()]);
}

#[tokio::test]
async fn deferred_lock_can_be_released_before_it_applies() {
    let store = store();
    let q = queue(&store, "q");
    store
        .enqueue(NewWorkItem::new("http://t/1").queue("q").lock_when_complete("L"))
        .await
        .unwrap();

    let item = store.next_work_item(shard0()).await.unwrap().unwrap();
    store.release_external_lock(&q, "L").await.unwrap();
    store.complete_work_item(item.id, shard0()).await.unwrap();
    assert!(store.queue_state(&q).await.unwrap().is_none());
}

#[tokio::test]
async fn conflicting_deferred_lock_fails_completion() {
    let store = store();
    let q = queue(&store, "q");
    store
        .enqueue(NewWorkItem::new("http://t/1").queue("q").lock_when_complete("B"))
        .await
        .unwrap();

    let item = store.next_work_item(shard0()).await.unwrap().unwrap();
    store.acquire_external_lock(&q, "A").await.unwrap();
    let err = store.complete_work_item(item.id, shard0()).await.unwrap_err();
    assert!(matches!(err, Error::LockConflict { .. }));
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_blocking_is_rejected() {
    let store = store();
    let err = store
        .enqueue(NewWorkItem::new("http://t/1").queue("q").blocks("q"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBlockConfig(_)));
}

#[tokio::test]
async fn blocked_queue_waits_for_the_blocking_item() {
    let store = store();
    store
        .enqueue(NewWorkItem::new("http://t/parent").queue("parent").blocks("child"))
        .await
        .unwrap();
    enqueue(&store, "child", "http://t/child").await;

    let parent = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(parent.url, "http://t/parent");
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());
    let child_state = store
        .queue_state(&queue(&store, "child"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_state.blocked_by.len(), 1);

    store.complete_work_item(parent.id, shard0()).await.unwrap();
    let child = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(child.url, "http://t/child");
}

#[tokio::test]
async fn blocks_cross_shards() {
    let sharding = Sharding::new(16).unwrap();
    let store = MemoryStore::new(sharding);

    // Find two queue names on different shards.
    let parent_name = "parent".to_string();
    let parent_shard = sharding.shard_for(&parent_name);
    let child_name = (0..)
        .map(|i| format!("child-{i}"))
        .find(|name| sharding.shard_for(name) != parent_shard)
        .unwrap();
    let child_shard = sharding.shard_for(&child_name);

    store
        .enqueue(
            NewWorkItem::new("http://t/parent")
                .queue(&parent_name)
                .blocks(&child_name),
        )
        .await
        .unwrap();
    enqueue(&store, &child_name, "http://t/child").await;

    assert!(store.next_work_item(child_shard).await.unwrap().is_none());
    let parent = store.next_work_item(parent_shard).await.unwrap().unwrap();
    store.complete_work_item(parent.id, parent_shard).await.unwrap();

    let child = store.next_work_item(child_shard).await.unwrap().unwrap();
    assert_eq!(child.url, "http://t/child");
}

#[tokio::test]
async fn completing_a_blocked_item_is_rejected() {
    let store = store();
    let child = enqueue(&store, "child", "http://t/child").await;
    let claimed = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(claimed.id, child);

    // The block arrives after the child was already claimed.
    store
        .enqueue(NewWorkItem::new("http://t/parent").queue("parent").blocks("child"))
        .await
        .unwrap();
    store.next_work_item(shard0()).await.unwrap();

    let err = store.complete_work_item(child, shard0()).await.unwrap_err();
    assert!(matches!(err, Error::BlockedItemCompleted { .. }));
}

#[tokio::test]
async fn placeholder_inherits_the_block_of_a_locked_queue() {
    let store = store();
    let parent_q = queue(&store, "parent");
    store
        .enqueue(
            NewWorkItem::new("http://t/parent")
                .queue("parent")
                .blocks("child")
                .lock_when_complete("L"),
        )
        .await
        .unwrap();
    enqueue(&store, "child", "http://t/child").await;

    let parent = store.next_work_item(shard0()).await.unwrap().unwrap();
    store.complete_work_item(parent.id, shard0()).await.unwrap();

    // The parent queue is now locked and headed by a placeholder that still
    // blocks the child.
    assert!(store.next_work_item(shard0()).await.unwrap().is_none());
    let child_state = store
        .queue_state(&queue(&store, "child"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_state.blocked_by.len(), 1);
    assert_ne!(child_state.blocked_by[0].work_item_id, parent.id);

    store.release_external_lock(&parent_q, "L").await.unwrap();
    let placeholder = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert!(placeholder.is_noop());
    store.complete_work_item(placeholder.id, shard0()).await.unwrap();
    assert!(store.queue_state(&parent_q).await.unwrap().is_none());

    let child = store.next_work_item(shard0()).await.unwrap().unwrap();
    assert_eq!(child.url, "http://t/child");
}

// ---------------------------------------------------------------------------
// Cron transactions and reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cron_transaction_commits_atomically() {
    let store = store();

    let mut tx = store.begin_cron_transaction().await.unwrap();
    tx.create_cron_job("nightly").await.unwrap();
    let job = tx.select_and_lock_cron_job("nightly").await.unwrap();
    assert_eq!(job.last_ran_at, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    tx.enqueue_work_item(NewWorkItem::new("http://t/nightly").queue("nightly"))
        .await
        .unwrap();
    drop(tx);

    assert!(store.get_cron_job_state().await.unwrap().is_empty());
    assert!(drain(&store).await.is_empty());

    let now = chrono::Utc::now();
    let mut tx = store.begin_cron_transaction().await.unwrap();
    tx.create_cron_job("nightly").await.unwrap();
    tx.update_cron_job_last_ran_at("nightly", now).await.unwrap();
    tx.enqueue_work_item(NewWorkItem::new("http://t/nightly").queue("nightly"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let state = store.get_cron_job_state().await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].last_ran_at, now);
    assert!(state[0].active);
    assert_eq!(drain(&store).await, vec!["http://t/nightly".to_string()]);
}

#[tokio::test]
async fn delete_all_data_resets_everything() {
    let store = store();
    enqueue(&store, "q", "http://t/1").await;
    store.pause_queue(&queue(&store, "p")).await.unwrap();
    let mut tx = store.begin_cron_transaction().await.unwrap();
    tx.create_cron_job("job").await.unwrap();
    tx.commit().await.unwrap();

    store.delete_all_data().await.unwrap();

    assert!(store.queue_state(&queue(&store, "p")).await.unwrap().is_none());
    assert!(store.get_cron_job_state().await.unwrap().is_empty());
    assert!(drain(&store).await.is_empty());
    assert!(store.queue_health_check().await.unwrap().healthy);
}
