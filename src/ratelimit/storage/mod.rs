//! Storage backends for client state.
//!
//! A backend's one job is to run a [`ClientTransaction`] against the state of
//! a single key atomically: no two transactions on the same key may observe
//! the same pre-state, while transactions on different keys proceed
//! independently.

mod memory;
mod redis_store;

use async_trait::async_trait;

use super::state::{ClientState, Decision};
use crate::error::Result;

pub use self::memory::MemoryStorage;
pub use self::redis_store::{RedisStorage, RedisStorageConfig, RedisTarget};

/// A read-modify-write step applied to one client's state.
///
/// Implementations must be deterministic in the state they are given: an
/// optimistic backend may discard a result and apply the transaction again
/// to a fresher state.
pub trait ClientTransaction: Send + Sync {
    /// Update `state` in place and report the decision it produced.
    fn apply(&self, state: &mut ClientState) -> Decision;
}

/// Trait for client state storage implementations.
///
/// This trait abstracts over the in-process `MemoryStorage` and the shared
/// `RedisStorage` so limiters can work with either.
#[async_trait]
pub trait RateLimiterStorage: Send + Sync {
    /// Apply `transaction` to the state stored under `key`, starting from the
    /// zero state if the key is unknown, and persist the result.
    async fn perform_transaction(
        &self,
        key: &str,
        transaction: &dyn ClientTransaction,
    ) -> Result<Decision>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
