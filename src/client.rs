//! The injected sync client: one instance per process or session, wired
//! explicitly and passed by reference, with an explicit lifecycle instead of
//! ambient module-level caches.
//!
//! ```no_run
//! use cache_sync::{CacheKey, QueryOptions, SyncClient, SyncConfig, SyncError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> cache_sync::SyncResult<()> {
//!     let client = SyncClient::init(SyncConfig::default());
//!
//!     let user = CacheKey::parse("user:42")?;
//!     let result = client
//!         .query(
//!             &user,
//!             || async { Ok::<_, SyncError>(json!({"id": 42, "name": "Ann"})) },
//!             &QueryOptions::default(),
//!         )
//!         .await?;
//!     println!("value = {:?}, stale = {}", result.value, result.is_stale);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::entry::ChangeEvent;
use crate::error::{SyncError, SyncResult};
use crate::invalidation::InvalidationEngine;
use crate::key::{CacheKey, KeyPattern};
use crate::mutation::{MutationCoordinator, MutationOptions, MutationOutcome, SyncOperation};
use crate::query::{Fetcher, QueryCoordinator, QueryOptions, QueryResult, RefreshGuard};
use crate::stats::{StatsCollector, SyncStats};
use crate::store::{CacheStore, SubscriptionId, SubscriptionMatcher};
use crate::sync_queue::{PermanentFailure, SyncQueue};

/// How long past its TTL an entry may linger before the sweep removes it.
const SWEEP_GRACE: Duration = Duration::from_secs(60);

/// A push message from the real-time stream, translated into a direct cache
/// write or invalidation so the cache stays current without a refetch.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// The server pushed a new value for a single entity.
    Update {
        key: CacheKey,
        value: Value,
        ttl: Duration,
    },
    /// The entity is gone.
    Delete { key: CacheKey },
    /// Everything matching the pattern is out of date.
    Pattern { pattern: KeyPattern },
    /// A batch of entities is out of date.
    Batch { keys: Vec<CacheKey> },
}

/// Facade over the cache store, the coordinators and the sync queue.
pub struct SyncClient {
    config: SyncConfig,
    store: Arc<CacheStore>,
    invalidation: Arc<InvalidationEngine>,
    queries: Arc<QueryCoordinator>,
    mutations: MutationCoordinator,
    queue: Arc<SyncQueue>,
    online_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    stats: StatsCollector,
}

impl SyncClient {
    /// Build the component graph and spawn the background flush and sweep
    /// loops. Requires a running tokio runtime.
    pub fn init(config: SyncConfig) -> Arc<Self> {
        let stats = StatsCollector::new();
        let (online_tx, online_rx) = watch::channel(config.start_online);

        let store = Arc::new(CacheStore::new(config.max_entries, stats.clone()));
        let invalidation = Arc::new(InvalidationEngine::new(store.clone()));
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            invalidation.clone(),
            online_rx,
            &config,
            stats.clone(),
        ));
        let queries = Arc::new(QueryCoordinator::new(store.clone(), stats.clone()));
        let mutations = MutationCoordinator::new(store.clone(), queue.clone());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(queue.clone().run()));
        tasks.push(tokio::spawn(Self::sweep_loop(
            store.clone(),
            config.sweep_interval,
        )));

        info!(
            online = config.start_online,
            max_entries = config.max_entries,
            max_queue_len = config.max_queue_len,
            "Sync client initialized"
        );

        Arc::new(Self {
            config,
            store,
            invalidation,
            queries,
            mutations,
            queue,
            online_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    async fn sweep_loop(store: Arc<CacheStore>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            store.sweep_expired(SWEEP_GRACE);
        }
    }

    /// Flush what can still be flushed, then stop the background loops.
    /// Further calls on the client fail with [`SyncError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_online() && self.queue.pending() > 0 {
            let settled = self.queue.flush().await;
            info!(settled, "Final sync flush before shutdown");
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.queries.shutdown();
        info!(pending = self.queue.pending(), "Sync client shut down");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Query options seeded from this client's configuration.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: self.config.default_ttl,
            retry: self.config.default_retry.clone(),
            ..Default::default()
        }
    }

    /// Cache-first read; see [`QueryCoordinator::query`].
    pub async fn query(
        &self,
        key: &CacheKey,
        fetcher: impl Fetcher + 'static,
        options: &QueryOptions,
    ) -> SyncResult<QueryResult> {
        self.ensure_open()?;
        Ok(self.queries.query(key, Arc::new(fetcher), options).await)
    }

    /// Forced fetch, bypassing freshness but not deduplication.
    pub async fn refetch(
        &self,
        key: &CacheKey,
        fetcher: impl Fetcher + 'static,
        options: &QueryOptions,
    ) -> SyncResult<QueryResult> {
        self.ensure_open()?;
        Ok(self.queries.refetch(key, Arc::new(fetcher), options).await)
    }

    /// Attach a background-refresh subscriber for `key`; see
    /// [`QueryCoordinator::subscribe_refresh`].
    pub fn subscribe_refresh(
        &self,
        key: &CacheKey,
        fetcher: impl Fetcher + 'static,
        options: QueryOptions,
    ) -> SyncResult<RefreshGuard> {
        self.ensure_open()?;
        Ok(self
            .queries
            .subscribe_refresh(key, Arc::new(fetcher), options))
    }

    /// Execute a mutation; see [`MutationCoordinator::mutate`].
    pub async fn mutate(
        &self,
        operation: impl SyncOperation + 'static,
        payload: Value,
        options: MutationOptions,
    ) -> SyncResult<MutationOutcome> {
        self.ensure_open()?;
        self.mutations
            .mutate(Arc::new(operation), payload, options)
            .await
    }

    /// Subscribe to entry transitions on an exact key or a wildcard pattern.
    /// The subscription lives until [`SyncClient::unsubscribe`].
    pub fn subscribe(
        &self,
        key_or_pattern: &str,
        callback: impl Fn(ChangeEvent) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionId> {
        self.ensure_open()?;
        let matcher = SubscriptionMatcher::parse(key_or_pattern)?;
        Ok(self.store.subscribe(matcher, Arc::new(callback)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Pattern invalidation; the empty pattern matches nothing.
    pub fn invalidate(&self, pattern: &str) -> SyncResult<usize> {
        self.ensure_open()?;
        Ok(self.invalidation.invalidate(&KeyPattern::parse(pattern)))
    }

    /// Exact-key invalidation.
    pub fn invalidate_key(&self, key: &CacheKey) -> SyncResult<bool> {
        self.ensure_open()?;
        Ok(self.invalidation.invalidate_key(key))
    }

    /// Drop the entire cache.
    pub fn clear_all(&self) -> SyncResult<usize> {
        self.ensure_open()?;
        Ok(self.invalidation.clear_all())
    }

    /// Write a value directly, e.g. from a real-time message that already
    /// carries the entity.
    pub fn set(&self, key: &CacheKey, value: Value, ttl: Duration) -> SyncResult<u64> {
        self.ensure_open()?;
        Ok(self.store.set(key, value, ttl))
    }

    /// Translate a push event into the matching cache operation. Returns the
    /// number of entries touched.
    pub fn apply_remote(&self, event: RemoteEvent) -> SyncResult<usize> {
        self.ensure_open()?;
        let touched = match event {
            RemoteEvent::Update { key, value, ttl } => {
                debug!(key = %key, "Applying remote update");
                self.store.set(&key, value, ttl);
                1
            }
            RemoteEvent::Delete { key } => usize::from(self.invalidation.invalidate_key(&key)),
            RemoteEvent::Pattern { pattern } => self.invalidation.invalidate(&pattern),
            RemoteEvent::Batch { keys } => self.invalidation.invalidate_batch(&keys),
        };
        Ok(touched)
    }

    /// Feed the connectivity signal. Flipping to online wakes the sync
    /// queue.
    pub fn set_online(&self, online: bool) {
        let was = self.online_tx.send_replace(online);
        if was != online {
            info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Flush the sync queue immediately and return the number of items
    /// settled.
    pub async fn sync_now(&self) -> SyncResult<usize> {
        self.ensure_open()?;
        Ok(self.queue.flush().await)
    }

    /// Number of unsettled queued mutations.
    pub fn pending_mutations(&self) -> usize {
        self.queue.pending()
    }

    /// Permanent-failure channel; yields `Some` for the first caller.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<PermanentFailure>> {
        self.queue.take_failure_receiver()
    }

    /// Direct store access for read-side integrations.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }
}
