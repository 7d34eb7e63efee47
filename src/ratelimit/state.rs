//! Per-client state and limiter decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What the limiter remembers about one client key.
///
/// The default value is the zero state: no admissions, no timeout and a last
/// request at the Unix epoch, which is always admissible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientState {
    /// Number of admitted requests so far
    pub num_requests: u64,
    /// Penalty to wait out (measured from `last_request`) before the next admission
    pub timeout: Duration,
    /// When the most recent request was admitted
    pub last_request: DateTime<Utc>,
}

impl ClientState {
    /// Time left on the active penalty at `now`.
    ///
    /// A clock that reads earlier than `last_request` counts as zero elapsed.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - self.last_request).to_std().unwrap_or(Duration::ZERO);
        self.timeout.saturating_sub(elapsed)
    }

    /// Whether a request at `now` falls outside the active penalty.
    pub fn is_admissible_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_at(now).is_zero()
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Time until a request could be admitted; zero when allowed
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            remaining: Duration::ZERO,
        }
    }

    pub fn deny(remaining: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
        }
    }

    /// Conjunction of two independent decisions.
    ///
    /// Denied if either side denies, with the longer of the two waits.
    pub fn and(self, other: Decision) -> Decision {
        if self.allowed && other.allowed {
            Decision::allow()
        } else {
            Decision::deny(self.remaining.max(other.remaining))
        }
    }
}
