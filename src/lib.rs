//! Data synchronization and cache coordination for client applications.
//!
//! Keeps derived UI state consistent with a remote source of truth while
//! minimizing redundant network calls and tolerating intermittent
//! connectivity. One [`SyncClient`] per process or session owns the whole
//! layer; consumers read snapshots and subscribe to change notifications.
//!
//! # Architecture
//!
//! ```text
//! UI / app code
//!   |  query(key)                        mutate(op, payload)
//!   v                                      v
//! QueryCoordinator                     MutationCoordinator
//!   | cache-first, dedup,                | optimistic write + undo record
//!   | retry, refresh                     v
//!   |                                  SyncQueue (FIFO per key group,
//!   v                                    retries, overflow policy)
//! CacheStore  <--- InvalidationEngine <--- commit / rollback
//!   | TTL + versions + epochs
//!   v
//! Subscriptions (created / updated / invalidated)
//! ```
//!
//! Real-time push events enter through [`SyncClient::apply_remote`] as
//! direct writes or invalidations; a connectivity signal
//! ([`SyncClient::set_online`]) gates background sync.
//!
//! # Example
//!
//! ```no_run
//! use cache_sync::{
//!     CacheKey, InvalidateSpec, KeyPattern, MutationOptions, OptimisticUpdate,
//!     QueryOptions, SyncClient, SyncConfig, SyncError,
//! };
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> cache_sync::SyncResult<()> {
//!     let client = SyncClient::init(SyncConfig::default());
//!
//!     // Cache-first read: concurrent callers for the same key share one fetch.
//!     let user = CacheKey::parse("user:42")?;
//!     let profile = client
//!         .query(
//!             &user,
//!             || async { Ok::<_, SyncError>(json!({"id": 42, "following": false})) },
//!             &QueryOptions::default(),
//!         )
//!         .await?;
//!     println!("profile = {:?}", profile.value);
//!
//!     // Optimistic mutation: the cache flips immediately, the remote call is
//!     // queued, and a failure restores the exact prior value.
//!     let options = MutationOptions {
//!         kind: "follow".into(),
//!         optimistic: Some(OptimisticUpdate::new(
//!             user.clone(),
//!             Duration::from_secs(30),
//!             |prior| {
//!                 let mut next = prior.cloned().unwrap_or_else(|| json!({}));
//!                 next["following"] = json!(true);
//!                 next
//!             },
//!         )),
//!         invalidate: InvalidateSpec::Patterns(vec![KeyPattern::parse("feed:*")]),
//!         ..Default::default()
//!     };
//!     client
//!         .mutate(
//!             |payload: serde_json::Value| async move { Ok::<_, SyncError>(payload) },
//!             json!({"user_id": 42}),
//!             options,
//!         )
//!         .await?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod entry;
mod error;
mod invalidation;
mod key;
mod mutation;
mod presets;
mod query;
mod retry;
mod stats;
mod store;
mod sync_queue;

pub use client::{RemoteEvent, SyncClient};
pub use config::SyncConfig;
pub use entry::{CachedValue, ChangeEvent, ChangeKind, EntryState, UndoRecord};
pub use error::{SyncError, SyncResult};
pub use invalidation::InvalidationEngine;
pub use key::{CacheKey, KeyPattern, KEY_SEPARATOR, WILDCARD};
pub use mutation::{
    InvalidateSpec, MutationCoordinator, MutationOptions, MutationOutcome, MutationStatus,
    OptimisticUpdate, SyncOperation,
};
pub use presets::{background_query, interactive_query, CachePolicy};
pub use query::{Fetcher, QueryCoordinator, QueryOptions, QueryResult, RefreshGuard};
pub use retry::{Backoff, RetryOptions};
pub use stats::{StatsCollector, SyncStats};
pub use store::{CacheStore, ChangeCallback, SubscriptionId, SubscriptionMatcher};
pub use sync_queue::{PermanentFailure, SyncQueue, SyncQueueItem};
