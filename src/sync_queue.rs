//! Background sync queue: pending mutation intents kept in memory, flushed
//! on an interval, on an explicit sync, or when connectivity returns.
//!
//! Items are processed FIFO within their key group so dependent mutations on
//! the same entity stay ordered, while independent groups flush in parallel.
//! Failed items back off exponentially and are retried until `max_retries`;
//! a drop is never silent: it rolls the optimistic write back, logs at
//! `error!` and lands on the permanent-failure channel, because it
//! represents a user-visible write that will never reach the server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::invalidation::InvalidationEngine;
use crate::mutation::{CompletionHooks, SyncOperation};
use crate::retry::RetryOptions;
use crate::stats::StatsCollector;
use crate::store::CacheStore;

/// A pending mutation intent. Created at optimistic-apply time, removed on
/// confirmed success, dropped and reported once retries are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    /// Mutation kind, e.g. `follow`, `unfollow`, `create`, `delete`.
    pub kind: String,
    pub payload: Value,
    /// Items sharing a key group are flushed strictly in order.
    pub key_group: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Critical items are never dropped to relieve queue overflow.
    pub critical: bool,
}

impl SyncQueueItem {
    pub fn new(
        kind: impl Into<String>,
        payload: Value,
        key_group: impl Into<String>,
        max_retries: u32,
        critical: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            key_group: key_group.into(),
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: max_retries.max(1),
            critical,
        }
    }
}

/// Observable record of an item that will never reach the server.
#[derive(Debug, Clone)]
pub struct PermanentFailure {
    pub item: SyncQueueItem,
    pub error: SyncError,
}

struct QueuedEntry {
    item: SyncQueueItem,
    operation: Arc<dyn SyncOperation>,
    hooks: CompletionHooks,
    /// Backoff eligibility; the item is skipped until this instant.
    not_before: Option<Instant>,
}

pub struct SyncQueue {
    items: Mutex<VecDeque<QueuedEntry>>,
    store: Arc<CacheStore>,
    invalidation: Arc<InvalidationEngine>,
    online_rx: watch::Receiver<bool>,
    wake: Notify,
    /// Serializes flushes so interval ticks, explicit syncs and online
    /// transitions never interleave over the same drained items.
    flush_lock: tokio::sync::Mutex<()>,
    failures_tx: mpsc::UnboundedSender<PermanentFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<PermanentFailure>>>,
    max_len: usize,
    flush_interval: std::time::Duration,
    backoff: RetryOptions,
    stats: StatsCollector,
}

impl SyncQueue {
    pub fn new(
        store: Arc<CacheStore>,
        invalidation: Arc<InvalidationEngine>,
        online_rx: watch::Receiver<bool>,
        config: &SyncConfig,
        stats: StatsCollector,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            items: Mutex::new(VecDeque::new()),
            store,
            invalidation,
            online_rx,
            wake: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            max_len: config.max_queue_len.max(1),
            flush_interval: config.flush_interval,
            backoff: config.default_retry.clone(),
            stats,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online_rx.borrow()
    }

    /// Number of queued, unsettled items.
    pub fn pending(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Receiver for permanent failures. Yields `Some` once; the channel
    /// belongs to whichever consumer takes it.
    pub fn take_failure_receiver(&self) -> Option<mpsc::UnboundedReceiver<PermanentFailure>> {
        self.failures_rx.lock().unwrap().take()
    }

    /// Nudge the background loop into an immediate flush.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Add an item. When the bound is hit, the oldest non-critical item is
    /// dropped (rolled back and reported) to make room; if everything queued
    /// is critical the new item is rejected instead.
    pub(crate) fn enqueue(
        &self,
        item: SyncQueueItem,
        operation: Arc<dyn SyncOperation>,
        hooks: CompletionHooks,
    ) -> SyncResult<()> {
        let mut displaced = Vec::new();
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.max_len {
                match items.iter().position(|entry| !entry.item.critical) {
                    Some(position) => {
                        if let Some(removed) = items.remove(position) {
                            displaced.push(removed);
                        }
                    }
                    None => {
                        drop(items);
                        warn!(
                            id = %item.id,
                            kind = %item.kind,
                            max_len = self.max_len,
                            "Sync queue full of critical items, rejecting enqueue"
                        );
                        let overflow = SyncError::QueueOverflow { dropped: 0 };
                        self.report_permanent(
                            QueuedEntry {
                                item,
                                operation,
                                hooks,
                                not_before: None,
                            },
                            overflow.clone(),
                        );
                        return Err(overflow);
                    }
                }
            }
            debug!(id = %item.id, kind = %item.kind, group = %item.key_group, "Sync item enqueued");
            items.push_back(QueuedEntry {
                item,
                operation,
                hooks,
                not_before: None,
            });
        }
        for entry in displaced {
            warn!(
                id = %entry.item.id,
                kind = %entry.item.kind,
                "Sync queue overflow, dropping oldest non-critical item"
            );
            self.report_permanent(entry, SyncError::QueueOverflow { dropped: 1 });
        }
        self.stats.record_enqueued();
        Ok(())
    }

    /// Process queued items: FIFO per key group, groups in parallel.
    /// Returns the number of items settled (committed or permanently
    /// dropped). A no-op while offline.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;
        if !self.is_online() {
            return 0;
        }
        let drained: Vec<QueuedEntry> = {
            let mut items = self.items.lock().unwrap();
            items.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }
        debug!(pending = drained.len(), "Flushing sync queue");

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, VecDeque<QueuedEntry>> = HashMap::new();
        for entry in drained {
            let group = entry.item.key_group.clone();
            if !groups.contains_key(&group) {
                order.push(group.clone());
            }
            groups.entry(group).or_default().push_back(entry);
        }

        let results = join_all(
            order
                .into_iter()
                .filter_map(|group| groups.remove(&group))
                .map(|entries| self.process_group(entries)),
        )
        .await;

        let mut settled = 0;
        let mut leftovers = Vec::new();
        for (count, leftover) in results {
            settled += count;
            leftovers.extend(leftover);
        }
        if !leftovers.is_empty() {
            let mut items = self.items.lock().unwrap();
            for entry in leftovers.into_iter().rev() {
                items.push_front(entry);
            }
        }
        if settled > 0 {
            info!(settled, remaining = self.pending(), "Sync queue flush complete");
        }
        settled
    }

    async fn process_group(&self, mut entries: VecDeque<QueuedEntry>) -> (usize, Vec<QueuedEntry>) {
        let mut settled = 0;
        while let Some(mut entry) = entries.pop_front() {
            if let Some(not_before) = entry.not_before {
                if Instant::now() < not_before {
                    // Still backing off. Later items in the group wait too,
                    // to keep dependent mutations ordered.
                    entries.push_front(entry);
                    break;
                }
            }
            entry.item.retry_count += 1;
            match entry.operation.execute(&entry.item.payload).await {
                Ok(value) => {
                    debug!(id = %entry.item.id, kind = %entry.item.kind, "Sync item committed");
                    let QueuedEntry { item, hooks, .. } = entry;
                    hooks.commit(&self.store, &self.invalidation, &item.payload, value, &self.stats);
                    self.stats.record_flushed();
                    settled += 1;
                }
                Err(err) => {
                    let attempts = entry.item.retry_count;
                    if !err.is_retryable() || attempts >= entry.item.max_retries {
                        let final_error = if err.is_retryable() && attempts > 1 {
                            SyncError::RetriesExhausted {
                                attempts,
                                last: Box::new(err),
                            }
                        } else {
                            err
                        };
                        self.report_permanent(entry, final_error);
                        settled += 1;
                    } else {
                        let delay = self.backoff.delay_after(attempts);
                        warn!(
                            id = %entry.item.id,
                            kind = %entry.item.kind,
                            attempts,
                            max_retries = entry.item.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Sync item failed, will retry"
                        );
                        entry.not_before = Some(Instant::now() + delay);
                        entries.push_front(entry);
                        break;
                    }
                }
            }
        }
        (settled, entries.into_iter().collect())
    }

    fn report_permanent(&self, entry: QueuedEntry, err: SyncError) {
        let QueuedEntry { item, hooks, .. } = entry;
        error!(
            id = %item.id,
            kind = %item.kind,
            attempts = item.retry_count,
            error = %err,
            "Sync item dropped permanently"
        );
        let final_error = hooks.settle_failure(&self.store, err);
        self.stats.record_dropped();
        let _ = self.failures_tx.send(PermanentFailure {
            item,
            error: final_error,
        });
    }

    /// Background loop: flush on the interval, on [`SyncQueue::wake`] and on
    /// every offline-to-online transition. Runs until aborted by the client.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut online_rx = self.online_rx.clone();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            max_len = self.max_len,
            "Sync queue loop starting"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = self.wake.notified() => {
                    self.flush().await;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online_rx.borrow() {
                        info!("Connectivity restored, flushing sync queue");
                        self.flush().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::InvalidateSpec;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        queue: Arc<SyncQueue>,
        online_tx: watch::Sender<bool>,
    }

    fn harness(max_len: usize) -> Harness {
        let stats = StatsCollector::new();
        let store = Arc::new(CacheStore::new(10_000, stats.clone()));
        let invalidation = Arc::new(InvalidationEngine::new(store.clone()));
        let (online_tx, online_rx) = watch::channel(true);
        let config = SyncConfig {
            max_queue_len: max_len,
            default_retry: RetryOptions {
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let queue = Arc::new(SyncQueue::new(store, invalidation, online_rx, &config, stats));
        Harness { queue, online_tx }
    }

    fn item(kind: &str, group: &str, max_retries: u32, critical: bool) -> SyncQueueItem {
        SyncQueueItem::new(kind, json!({}), group, max_retries, critical)
    }

    fn ok_operation(calls: Arc<AtomicU32>) -> Arc<dyn SyncOperation> {
        Arc::new(move |_payload: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SyncError>(json!("done"))
            }
        })
    }

    fn failing_operation(calls: Arc<AtomicU32>) -> Arc<dyn SyncOperation> {
        Arc::new(move |_payload: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(SyncError::fetch("remote down"))
            }
        })
    }

    #[tokio::test]
    async fn test_flush_settles_items_in_order() {
        let h = harness(16);
        let calls = Arc::new(AtomicU32::new(0));
        for i in 0..3 {
            h.queue
                .enqueue(
                    item(&format!("op-{i}"), "user:1", 3, false),
                    ok_operation(calls.clone()),
                    CompletionHooks::detached(),
                )
                .unwrap();
        }
        assert_eq!(h.queue.pending(), 3);

        let settled = h.queue.flush().await;
        assert_eq!(settled, 3);
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_group_halts_at_first_failure_to_preserve_order() {
        let h = harness(16);
        let failing = Arc::new(AtomicU32::new(0));
        let succeeding = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(
                item("follow", "user:1", 3, false),
                failing_operation(failing.clone()),
                CompletionHooks::detached(),
            )
            .unwrap();
        h.queue
            .enqueue(
                item("unfollow", "user:1", 3, false),
                ok_operation(succeeding.clone()),
                CompletionHooks::detached(),
            )
            .unwrap();

        h.queue.flush().await;
        // The head of the group failed; the dependent item must not run.
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(succeeding.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.pending(), 2);
    }

    #[tokio::test]
    async fn test_independent_groups_flush_even_when_one_fails() {
        let h = harness(16);
        let failing = Arc::new(AtomicU32::new(0));
        let succeeding = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(
                item("follow", "user:1", 3, false),
                failing_operation(failing.clone()),
                CompletionHooks::detached(),
            )
            .unwrap();
        h.queue
            .enqueue(
                item("like", "post:9", 3, false),
                ok_operation(succeeding.clone()),
                CompletionHooks::detached(),
            )
            .unwrap();

        h.queue.flush().await;
        assert_eq!(succeeding.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_item_attempted_exactly_max_retries_times() {
        let h = harness(16);
        let mut failures = h.queue.take_failure_receiver().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(
                item("follow", "user:1", 3, false),
                failing_operation(calls.clone()),
                CompletionHooks::detached(),
            )
            .unwrap();

        for _ in 0..20 {
            h.queue.flush().await;
            if h.queue.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.queue.pending(), 0);

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.item.retry_count, 3);
        assert!(matches!(
            failure.error,
            SyncError::RetriesExhausted { attempts: 3, .. }
        ));
        // Exactly one permanent-failure event.
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let h = harness(16);
        let mut failures = h.queue.take_failure_receiver().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let operation: Arc<dyn SyncOperation> = Arc::new(move |_payload: Value| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(SyncError::Validation("bad payload".into()))
            }
        });
        h.queue
            .enqueue(item("create", "post:1", 5, false), operation, CompletionHooks::detached())
            .unwrap();

        h.queue.flush().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.pending(), 0);
        assert!(matches!(
            failures.try_recv().unwrap().error,
            SyncError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_non_critical() {
        let h = harness(2);
        let mut failures = h.queue.take_failure_receiver().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        h.queue
            .enqueue(item("a", "g:1", 3, true), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();
        h.queue
            .enqueue(item("b", "g:2", 3, false), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();
        h.queue
            .enqueue(item("c", "g:3", 3, false), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();

        assert_eq!(h.queue.pending(), 2);
        let dropped = failures.try_recv().unwrap();
        assert_eq!(dropped.item.kind, "b");
        assert!(matches!(dropped.error, SyncError::QueueOverflow { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_rejected_when_queue_is_all_critical() {
        let h = harness(1);
        let calls = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(item("a", "g:1", 3, true), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();

        let result = h.queue.enqueue(
            item("b", "g:2", 3, true),
            ok_operation(calls),
            CompletionHooks::detached(),
        );
        assert!(matches!(result, Err(SyncError::QueueOverflow { .. })));
        assert_eq!(h.queue.pending(), 1);
    }

    #[tokio::test]
    async fn test_flush_is_a_noop_while_offline() {
        let h = harness(16);
        h.online_tx.send_replace(false);
        let calls = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(item("a", "g:1", 3, false), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();

        assert_eq!(h.queue.flush().await, 0);
        assert_eq!(h.queue.pending(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.online_tx.send_replace(true);
        assert_eq!(h.queue.flush().await, 1);
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_flushes_on_connectivity_restore() {
        let h = harness(16);
        h.online_tx.send_replace(false);
        let calls = Arc::new(AtomicU32::new(0));
        h.queue
            .enqueue(item("a", "g:1", 3, false), ok_operation(calls.clone()), CompletionHooks::detached())
            .unwrap();

        let loop_handle = tokio::spawn(h.queue.clone().run());
        h.online_tx.send_replace(true);

        for _ in 0..50 {
            if h.queue.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        loop_handle.abort();
    }

    #[tokio::test]
    async fn test_invalidate_spec_none_is_default() {
        // Exercises the detached-hooks path used throughout these tests.
        let hooks = CompletionHooks::detached();
        assert!(matches!(hooks.invalidate, InvalidateSpec::None));
    }
}
