//! Mutation coordinator: remote writes with optimistic cache updates and
//! guaranteed rollback.
//!
//! Each mutation moves through `Pending -> (OptimisticApplied) -> Settling
//! -> Committed | RolledBack`. The optimistic snapshot is captured
//! synchronously before the write, the remote operation is always enqueued
//! on the sync queue, and settlement either confirms the entry and runs the
//! invalidation spec, or restores the snapshot. Rollback is version-guarded:
//! it never clobbers a write that landed after the optimistic apply, which
//! is the main lost-update hazard in this layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::entry::UndoRecord;
use crate::error::{SyncError, SyncResult};
use crate::invalidation::InvalidationEngine;
use crate::key::{CacheKey, KeyPattern};
use crate::stats::StatsCollector;
use crate::store::CacheStore;
use crate::sync_queue::{SyncQueue, SyncQueueItem};

/// The remote side of a mutation: an opaque async operation receiving the
/// item payload. Implementations signal retryability through the error
/// variant they return ([`SyncError::Fetch`] retries, [`SyncError::Validation`]
/// does not).
#[async_trait]
pub trait SyncOperation: Send + Sync {
    async fn execute(&self, payload: &Value) -> SyncResult<Value>;
}

#[async_trait]
impl<F, Fut> SyncOperation for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<Value>> + Send,
{
    async fn execute(&self, payload: &Value) -> SyncResult<Value> {
        (self)(payload.clone()).await
    }
}

/// Optimistic cache write applied before the remote operation settles.
#[derive(Clone)]
pub struct OptimisticUpdate {
    pub key: CacheKey,
    /// Computes the optimistic value from the current cached one.
    pub apply: Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>,
    pub ttl: Duration,
}

impl OptimisticUpdate {
    pub fn new(
        key: CacheKey,
        ttl: Duration,
        apply: impl Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            apply: Arc::new(apply),
            ttl,
        }
    }
}

/// Which cache entries a committed mutation invalidates: a static pattern
/// list, or a function of the payload.
#[derive(Clone)]
pub enum InvalidateSpec {
    None,
    Patterns(Vec<KeyPattern>),
    Compute(Arc<dyn Fn(&Value) -> Vec<KeyPattern> + Send + Sync>),
}

impl InvalidateSpec {
    fn patterns(&self, payload: &Value) -> Vec<KeyPattern> {
        match self {
            Self::None => Vec::new(),
            Self::Patterns(patterns) => patterns.clone(),
            Self::Compute(compute) => compute(payload),
        }
    }
}

#[derive(Clone)]
pub struct MutationOptions {
    /// Mutation kind, used as the queue key group when there is no
    /// optimistic key (e.g. `follow`, `create`).
    pub kind: String,
    pub optimistic: Option<OptimisticUpdate>,
    pub invalidate: InvalidateSpec,
    /// When `false`, the first remote failure is permanent and rolls back
    /// immediately; when `true`, the sync queue retries up to `max_retries`.
    pub retry_on_failure: bool,
    pub max_retries: u32,
    /// Critical items survive queue overflow.
    pub critical: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            kind: "mutation".into(),
            optimistic: None,
            invalidate: InvalidateSpec::None,
            retry_on_failure: true,
            max_retries: 3,
            critical: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// The remote operation succeeded and the cache was settled.
    Committed,
    /// Accepted while offline; settlement happens when connectivity returns.
    Queued,
}

#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub status: MutationStatus,
    /// The remote operation's result, present for committed mutations.
    pub value: Option<Value>,
    pub item_id: Uuid,
}

/// Settlement actions carried by a queued item: confirm or restore the
/// optimistic entry, run the invalidation spec, and answer an awaiting
/// caller.
pub(crate) struct CompletionHooks {
    pub(crate) optimistic_key: Option<CacheKey>,
    pub(crate) undo: Option<UndoRecord>,
    pub(crate) invalidate: InvalidateSpec,
    pub(crate) notify: Option<oneshot::Sender<SyncResult<Value>>>,
}

impl CompletionHooks {
    /// Hooks with no optimistic entry, no invalidation and no waiter.
    pub(crate) fn detached() -> Self {
        Self {
            optimistic_key: None,
            undo: None,
            invalidate: InvalidateSpec::None,
            notify: None,
        }
    }

    /// Remote success: settle the optimistic entry as `Fresh` (unless a
    /// newer write already replaced it), invalidate affected queries and
    /// discard the undo record.
    pub(crate) fn commit(
        mut self,
        store: &CacheStore,
        invalidation: &InvalidationEngine,
        payload: &Value,
        value: Value,
        stats: &StatsCollector,
    ) {
        if let (Some(key), Some(undo)) = (self.optimistic_key.take(), self.undo.take()) {
            store.confirm(&key, undo.optimistic_version());
        }
        for pattern in self.invalidate.patterns(payload) {
            invalidation.invalidate(&pattern);
        }
        stats.record_commit();
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(Ok(value));
        }
    }

    /// Permanent remote failure: restore the snapshot and answer the waiter.
    ///
    /// A rollback that cannot be applied is never swallowed: the key is
    /// invalidated outright (forcing a refetch) and the returned error
    /// becomes [`SyncError::Rollback`].
    pub(crate) fn settle_failure(mut self, store: &CacheStore, err: SyncError) -> SyncError {
        let mut final_error = err;
        if let Some(undo) = self.undo.take() {
            let key = self.optimistic_key.take();
            match store.rollback(undo) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Rollback skipped, a newer write was retained");
                }
                Err(rollback_error) => {
                    if let Some(key) = &key {
                        store.mark_invalidated(key);
                    }
                    error!(error = %rollback_error, "Rollback failed, key invalidated");
                    final_error = rollback_error;
                }
            }
        }
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(Err(final_error.clone()));
        }
        final_error
    }
}

pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, queue: Arc<SyncQueue>) -> Self {
        Self { store, queue }
    }

    /// Execute a mutation.
    ///
    /// Online, this awaits settlement of the queued item and returns
    /// `Committed` or the settlement error. Offline, the optimistic write is
    /// visible immediately and `Queued` is returned; the sync queue settles
    /// the item when connectivity returns.
    pub async fn mutate(
        &self,
        operation: Arc<dyn SyncOperation>,
        payload: Value,
        options: MutationOptions,
    ) -> SyncResult<MutationOutcome> {
        let MutationOptions {
            kind,
            optimistic,
            invalidate,
            retry_on_failure,
            max_retries,
            critical,
        } = options;

        // Pending -> OptimisticApplied: the prior snapshot is captured
        // synchronously, under the key's lock, before the optimistic write.
        let (optimistic_key, undo) = match &optimistic {
            Some(update) => {
                let undo = self
                    .store
                    .set_optimistic(&update.key, |prior| (update.apply)(prior), update.ttl);
                (Some(update.key.clone()), Some(undo))
            }
            None => (None, None),
        };

        let key_group = optimistic_key
            .as_ref()
            .map(|key| key.as_str().to_owned())
            .unwrap_or_else(|| kind.clone());
        let retries = if retry_on_failure { max_retries.max(1) } else { 1 };
        let item = SyncQueueItem::new(kind, payload, key_group, retries, critical);
        let item_id = item.id;

        let (notify_tx, notify_rx) = oneshot::channel();
        let hooks = CompletionHooks {
            optimistic_key,
            undo,
            invalidate,
            notify: Some(notify_tx),
        };
        self.queue.enqueue(item, operation, hooks)?;

        if !self.queue.is_online() {
            debug!(%item_id, "Offline, mutation queued for background sync");
            return Ok(MutationOutcome {
                status: MutationStatus::Queued,
                value: None,
                item_id,
            });
        }

        // Settling: flush now; retries past this first pass are driven by
        // the background loop, and the oneshot resolves whenever the item
        // finally commits or drops.
        self.queue.flush().await;
        match notify_rx.await {
            Ok(Ok(value)) => Ok(MutationOutcome {
                status: MutationStatus::Committed,
                value: Some(value),
                item_id,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SyncError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::entry::EntryState;
    use crate::retry::RetryOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        store: Arc<CacheStore>,
        queue: Arc<SyncQueue>,
        mutations: MutationCoordinator,
        online_tx: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let stats = StatsCollector::new();
        let store = Arc::new(CacheStore::new(10_000, stats.clone()));
        let invalidation = Arc::new(InvalidationEngine::new(store.clone()));
        let (online_tx, online_rx) = watch::channel(true);
        let config = SyncConfig {
            default_retry: RetryOptions {
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            invalidation,
            online_rx,
            &config,
            stats,
        ));
        let mutations = MutationCoordinator::new(store.clone(), queue.clone());
        Harness {
            store,
            queue,
            mutations,
            online_tx,
        }
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::parse(s).unwrap()
    }

    fn follow_options(user_key: &CacheKey) -> MutationOptions {
        MutationOptions {
            kind: "follow".into(),
            optimistic: Some(OptimisticUpdate::new(
                user_key.clone(),
                Duration::from_secs(30),
                |prior| {
                    let mut next = prior.cloned().unwrap_or_else(|| json!({}));
                    next["following"] = json!(true);
                    next
                },
            )),
            invalidate: InvalidateSpec::Patterns(vec![KeyPattern::parse("feed:*")]),
            retry_on_failure: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_commit_settles_entry_and_invalidates() {
        let h = harness();
        let user = key("user:42");
        h.store
            .set(&user, json!({"following": false}), Duration::from_secs(30));
        h.store
            .set(&key("feed:home"), json!(["post"]), Duration::from_secs(30));

        let operation: Arc<dyn SyncOperation> =
            Arc::new(|_payload: Value| async move { Ok::<_, SyncError>(json!({"accepted": true})) });
        let outcome = h
            .mutations
            .mutate(operation, json!({"user_id": 42}), follow_options(&user))
            .await
            .unwrap();

        assert_eq!(outcome.status, MutationStatus::Committed);
        assert_eq!(outcome.value, Some(json!({"accepted": true})));

        let cached = h.store.get(&user).unwrap();
        assert_eq!(cached.state, EntryState::Fresh);
        assert_eq!(cached.value, json!({"following": true}));
        assert!(h.store.get(&key("feed:home")).is_none());
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_to_exact_prior_value() {
        let h = harness();
        let user = key("user:42");
        h.store
            .set(&user, json!({"following": false, "mutuals": 2}), Duration::from_secs(30));

        let operation: Arc<dyn SyncOperation> =
            Arc::new(|_payload: Value| async move { Err::<Value, _>(SyncError::fetch("remote down")) });
        let result = h
            .mutations
            .mutate(operation, json!({"user_id": 42}), follow_options(&user))
            .await;

        assert!(matches!(result, Err(SyncError::Fetch(_))));
        assert_eq!(
            h.store.get(&user).unwrap().value,
            json!({"following": false, "mutuals": 2})
        );
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued_with_optimistic_value() {
        let h = harness();
        h.online_tx.send_replace(false);
        let user = key("user:42");
        h.store
            .set(&user, json!({"following": false}), Duration::from_secs(30));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let operation: Arc<dyn SyncOperation> = Arc::new(move |_payload: Value| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SyncError>(json!({"accepted": true}))
            }
        });
        let outcome = h
            .mutations
            .mutate(operation, json!({"user_id": 42}), follow_options(&user))
            .await
            .unwrap();

        assert_eq!(outcome.status, MutationStatus::Queued);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.pending(), 1);

        let cached = h.store.get(&user).unwrap();
        assert_eq!(cached.state, EntryState::Optimistic);
        assert_eq!(cached.value, json!({"following": true}));

        // Connectivity returns; the queued item settles and the entry is
        // confirmed Fresh.
        h.online_tx.send_replace(true);
        h.queue.flush().await;
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get(&user).unwrap().state, EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_mutation_without_optimistic_update() {
        let h = harness();
        let operation: Arc<dyn SyncOperation> =
            Arc::new(|payload: Value| async move { Ok::<_, SyncError>(json!({"echo": payload})) });
        let outcome = h
            .mutations
            .mutate(
                operation,
                json!({"text": "hello"}),
                MutationOptions {
                    kind: "create".into(),
                    retry_on_failure: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, MutationStatus::Committed);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_computed_invalidation_receives_payload() {
        let h = harness();
        h.store
            .set(&key("chat:7:messages:0"), json!([]), Duration::from_secs(30));
        h.store
            .set(&key("chat:8:messages:0"), json!([]), Duration::from_secs(30));

        let operation: Arc<dyn SyncOperation> =
            Arc::new(|_payload: Value| async move { Ok::<_, SyncError>(json!({"ok": true})) });
        let options = MutationOptions {
            kind: "send-message".into(),
            invalidate: InvalidateSpec::Compute(Arc::new(|payload| {
                let chat = payload["chat_id"].as_u64().unwrap_or_default();
                vec![KeyPattern::parse(&format!("chat:{chat}:messages:*"))]
            })),
            retry_on_failure: false,
            ..Default::default()
        };
        h.mutations
            .mutate(operation, json!({"chat_id": 7}), options)
            .await
            .unwrap();

        assert!(h.store.get(&key("chat:7:messages:0")).is_none());
        assert!(h.store.get(&key("chat:8:messages:0")).is_some());
    }

    #[tokio::test]
    async fn test_rollback_preserves_concurrent_newer_write() {
        let h = harness();
        h.online_tx.send_replace(false);
        let user = key("user:42");
        h.store
            .set(&user, json!({"following": false}), Duration::from_secs(30));

        let operation: Arc<dyn SyncOperation> =
            Arc::new(|_payload: Value| async move { Err::<Value, _>(SyncError::fetch("down")) });
        h.mutations
            .mutate(operation, json!({}), follow_options(&user))
            .await
            .unwrap();

        // A real-time event lands between the optimistic apply and the
        // failed settlement.
        h.store
            .set(&user, json!({"following": true, "mutuals": 9}), Duration::from_secs(30));

        h.online_tx.send_replace(true);
        h.queue.flush().await;

        assert_eq!(
            h.store.get(&user).unwrap().value,
            json!({"following": true, "mutuals": 9})
        );
    }
}
