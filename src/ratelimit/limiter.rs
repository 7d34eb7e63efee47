//! Single-key rate limiter.

use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::Clock;
use super::policy::TimeoutPolicy;
use super::state::{ClientState, Decision};
use super::storage::{ClientTransaction, RateLimiterStorage};
use crate::error::Result;

/// Decides whether one client key may make a request right now.
///
/// A key is admitted once the timeout assigned at its previous admission has
/// elapsed. Every admission bumps the request count and assigns the next
/// timeout from the policy; denials leave the stored state untouched, so
/// retrying during a penalty neither extends nor shortens it.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Prefix separating this limiter's keys from others in the same storage
    namespace: String,
    storage: Arc<dyn RateLimiterStorage>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn TimeoutPolicy>,
}

impl RateLimiter {
    /// Create a rate limiter whose keys live under `namespace` in `storage`.
    pub fn new(
        namespace: impl Into<String>,
        storage: Arc<dyn RateLimiterStorage>,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn TimeoutPolicy>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            storage,
            clock,
            policy,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Check and record a request for `key`.
    pub async fn allow(&self, key: &str) -> Result<Decision> {
        let storage_key = format!("{}:{}", self.namespace, key);

        trace!(key = %storage_key, "Checking rate limit");

        let admission = Admission {
            clock: self.clock.as_ref(),
            policy: self.policy.as_ref(),
        };
        let decision = self
            .storage
            .perform_transaction(&storage_key, &admission)
            .await?;

        if !decision.allowed {
            debug!(
                key = %storage_key,
                remaining = ?decision.remaining,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// The admit-or-deny state transition.
struct Admission<'a> {
    clock: &'a dyn Clock,
    policy: &'a dyn TimeoutPolicy,
}

impl ClientTransaction for Admission<'_> {
    fn apply(&self, state: &mut ClientState) -> Decision {
        let now = self.clock.now();
        let remaining = state.remaining_at(now);

        if !remaining.is_zero() {
            return Decision::deny(remaining);
        }

        state.num_requests += 1;
        state.last_request = now;
        state.timeout = self.policy.timeout_for(state.num_requests);

        trace!(
            num_requests = state.num_requests,
            timeout = ?state.timeout,
            "Admitted request"
        );
        Decision::allow()
    }
}
