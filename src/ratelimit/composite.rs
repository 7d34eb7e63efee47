//! Dual-key (IP address + phone number) rate limiter.
//!
//! An attacker cycling through phone numbers from one address is stopped by
//! the IP limiter; one cycling through addresses against a single number is
//! stopped by the phone limiter. A request proceeds only when both agree.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join;
use tracing::{debug, error};

use super::clock::Clock;
use super::limiter::RateLimiter;
use super::policy::TimeoutPolicy;
use super::state::Decision;
use super::storage::RateLimiterStorage;
use crate::error::Result;

/// Penalty reported when the storage backend cannot be consulted.
pub const DEFAULT_FAILURE_PENALTY: Duration = Duration::from_secs(30 * 60);

/// Namespace of the IP-keyed limiter.
pub const IP_NAMESPACE: &str = "ip";
/// Namespace of the phone-keyed limiter.
pub const PHONE_NAMESPACE: &str = "phone";

/// The limiter consulted before sending an SMS or checking a code.
///
/// Storage failures fail closed: the request is denied with
/// `failure_penalty` (or the other limiter's wait if that is longer). A
/// backend outage therefore blocks legitimate users rather than opening the
/// door to SMS pumping.
#[derive(Debug)]
pub struct PhoneIpRateLimiter {
    ip: RateLimiter,
    phone: RateLimiter,
    failure_penalty: Duration,
}

impl PhoneIpRateLimiter {
    /// Combine two independently configured limiters.
    pub fn new(ip: RateLimiter, phone: RateLimiter) -> Self {
        Self {
            ip,
            phone,
            failure_penalty: DEFAULT_FAILURE_PENALTY,
        }
    }

    /// Build both limiters on one shared storage, separated by namespace.
    pub fn with_storage(
        storage: Arc<dyn RateLimiterStorage>,
        clock: Arc<dyn Clock>,
        ip_policy: Arc<dyn TimeoutPolicy>,
        phone_policy: Arc<dyn TimeoutPolicy>,
    ) -> Self {
        Self::new(
            RateLimiter::new(IP_NAMESPACE, storage.clone(), clock.clone(), ip_policy),
            RateLimiter::new(PHONE_NAMESPACE, storage, clock, phone_policy),
        )
    }

    /// Override the penalty reported on storage failure.
    pub fn with_failure_penalty(mut self, failure_penalty: Duration) -> Self {
        self.failure_penalty = failure_penalty;
        self
    }

    pub fn failure_penalty(&self) -> Duration {
        self.failure_penalty
    }

    /// Check and record a request from `ip` for `phone`.
    ///
    /// Both limiters are always consulted, so an admitted request advances
    /// both keys even when the other side ends up denying.
    pub async fn allow(&self, ip: &str, phone: &str) -> Decision {
        let (by_ip, by_phone) = join(self.ip.allow(ip), self.phone.allow(phone)).await;

        let decision = self
            .fail_closed(IP_NAMESPACE, by_ip)
            .and(self.fail_closed(PHONE_NAMESPACE, by_phone));

        debug!(
            ip = %ip,
            phone = %phone,
            allowed = decision.allowed,
            remaining = ?decision.remaining,
            "Rate limit decision made"
        );
        decision
    }

    fn fail_closed(&self, namespace: &str, result: Result<Decision>) -> Decision {
        result.unwrap_or_else(|e| {
            error!(
                namespace = namespace,
                error = %e,
                penalty = ?self.failure_penalty,
                "Rate limiter storage failed, denying request"
            );
            Decision::deny(self.failure_penalty)
        })
    }
}
