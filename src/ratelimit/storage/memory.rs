//! In-process client state storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{ClientTransaction, RateLimiterStorage};
use crate::error::{LimiterError, Result};
use crate::ratelimit::clock::Clock;
use crate::ratelimit::state::{ClientState, Decision};

/// Default horizon after which idle clients are forgotten.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

/// Client state kept in a sharded concurrent map.
///
/// A transaction holds the write lock of its key's shard for the duration of
/// the (I/O free) update, which makes it atomic per key. Entries are never
/// expired automatically; call [`MemoryStorage::remove_outdated`] or run
/// [`MemoryStorage::spawn_retention_sweeper`] to bound memory use.
#[derive(Debug)]
pub struct MemoryStorage {
    clients: DashMap<String, ClientState>,
    retention: Duration,
}

impl MemoryStorage {
    /// Create an empty storage with the default 48 hour retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create an empty storage that forgets clients idle for `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            retention,
        }
    }

    /// Current state for `key`, if any.
    pub fn get(&self, key: &str) -> Option<ClientState> {
        self.clients.get(key).map(|entry| *entry.value())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every client whose last admission is older than the retention
    /// horizon. Returns how many were removed.
    pub fn remove_outdated(&self, now: DateTime<Utc>) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, state| {
            let idle = (now - state.last_request).to_std().unwrap_or(Duration::ZERO);
            idle <= self.retention
        });
        let removed = before.saturating_sub(self.clients.len());

        debug!(
            removed = removed,
            remaining = self.clients.len(),
            "Removed outdated client states"
        );
        removed
    }

    /// Run [`remove_outdated`](Self::remove_outdated) every `interval` on a
    /// background task until the returned handle is aborted.
    ///
    /// `interval` must be non-zero.
    pub fn spawn_retention_sweeper(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(LimiterError::Config(
                "retention sweep interval must be greater than zero".into(),
            ));
        }

        info!(
            interval = ?interval,
            retention = ?self.retention,
            "Starting retention sweeper"
        );

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.remove_outdated(clock.now());
            }
        }))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterStorage for MemoryStorage {
    async fn perform_transaction(
        &self,
        key: &str,
        transaction: &dyn ClientTransaction,
    ) -> Result<Decision> {
        let mut entry = self.clients.entry(key.to_string()).or_default();
        let decision = transaction.apply(entry.value_mut());

        trace!(
            key = %key,
            num_requests = entry.num_requests,
            allowed = decision.allowed,
            "Applied in-memory transaction"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;

    /// Admits everything and counts admissions.
    struct Count;

    impl ClientTransaction for Count {
        fn apply(&self, state: &mut ClientState) -> Decision {
            state.num_requests += 1;
            Decision::allow()
        }
    }

    /// Stamps the state with a fixed time.
    struct Touch(DateTime<Utc>);

    impl ClientTransaction for Touch {
        fn apply(&self, state: &mut ClientState) -> Decision {
            state.last_request = self.0;
            Decision::allow()
        }
    }

    #[tokio::test]
    async fn test_unknown_key_starts_from_zero_state() {
        struct Inspect;
        impl ClientTransaction for Inspect {
            fn apply(&self, state: &mut ClientState) -> Decision {
                assert_eq!(*state, ClientState::default());
                Decision::allow()
            }
        }

        let storage = MemoryStorage::new();
        storage.perform_transaction("ip:127.0.0.1", &Inspect).await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_result_is_persisted() {
        let storage = MemoryStorage::new();

        storage.perform_transaction("phone:1", &Count).await.unwrap();
        storage.perform_transaction("phone:1", &Count).await.unwrap();

        assert_eq!(storage.get("phone:1").unwrap().num_requests, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let storage = MemoryStorage::new();

        storage.perform_transaction("a", &Count).await.unwrap();
        storage.perform_transaction("a", &Count).await.unwrap();
        storage.perform_transaction("b", &Count).await.unwrap();

        assert_eq!(storage.get("a").unwrap().num_requests, 2);
        assert_eq!(storage.get("b").unwrap().num_requests, 1);
        assert!(storage.get("c").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transactions_do_not_lose_updates() {
        let storage = Arc::new(MemoryStorage::new());

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    storage.perform_transaction("shared", &Count).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(storage.get("shared").unwrap().num_requests, 200);
    }

    #[test]
    fn test_remove_outdated() {
        let clock = MockClock::default();
        let storage = MemoryStorage::with_retention(Duration::from_secs(3600));
        let start = clock.now();

        tokio_test::block_on(async {
            storage.perform_transaction("old", &Touch(start)).await.unwrap();
            storage
                .perform_transaction("recent", &Touch(start + chrono::Duration::minutes(50)))
                .await
                .unwrap();
        });

        clock.advance(Duration::from_secs(90 * 60));
        let removed = storage.remove_outdated(clock.now());

        assert_eq!(removed, 1);
        assert!(storage.get("old").is_none());
        assert!(storage.get("recent").is_some());
    }

    #[test]
    fn test_remove_outdated_keeps_everything_within_horizon() {
        let clock = MockClock::default();
        let storage = MemoryStorage::new();

        tokio_test::block_on(async {
            storage.perform_transaction("a", &Touch(clock.now())).await.unwrap();
        });
        clock.advance(Duration::from_secs(47 * 60 * 60));

        assert_eq!(storage.remove_outdated(clock.now()), 0);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_sweeper_runs_in_background() {
        let clock = MockClock::default();
        let storage = Arc::new(MemoryStorage::with_retention(Duration::from_secs(60)));

        storage.perform_transaction("idle", &Touch(clock.now())).await.unwrap();
        clock.advance(Duration::from_secs(120));

        let handle = storage
            .clone()
            .spawn_retention_sweeper(Arc::new(clock.clone()), Duration::from_millis(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_retention_sweeper_rejects_zero_interval() {
        let storage = Arc::new(MemoryStorage::new());
        let result =
            storage.spawn_retention_sweeper(Arc::new(MockClock::default()), Duration::ZERO);

        assert!(matches!(result, Err(LimiterError::Config(_))));
    }
}
