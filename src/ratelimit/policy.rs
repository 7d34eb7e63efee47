//! Timeout policies.
//!
//! A policy maps the number of admitted requests to the penalty that must
//! elapse before the next admission. Policies are pure and must be monotonic
//! non-decreasing in the request count.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Maps a cumulative admission count to the timeout assigned after it.
pub trait TimeoutPolicy: Send + Sync + Debug {
    /// Timeout to enforce after the `num_requests`-th admission.
    fn timeout_for(&self, num_requests: u64) -> Duration;
}

/// Adapter that turns a plain function into a [`TimeoutPolicy`].
///
/// ```
/// use sms_ratelimit::ratelimit::{FnPolicy, TimeoutPolicy};
/// use std::time::Duration;
///
/// let policy = FnPolicy::new(|n| Duration::from_secs(n * 10));
/// assert_eq!(policy.timeout_for(3), Duration::from_secs(30));
/// ```
#[derive(Clone, Copy)]
pub struct FnPolicy<F>(F);

impl<F> FnPolicy<F>
where
    F: Fn(u64) -> Duration + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Debug for FnPolicy<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnPolicy")
    }
}

impl<F> TimeoutPolicy for FnPolicy<F>
where
    F: Fn(u64) -> Duration + Send + Sync,
{
    fn timeout_for(&self, num_requests: u64) -> Duration {
        (self.0)(num_requests)
    }
}

/// A single step in a [`BreakpointPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Admission count from which this timeout applies
    pub requests: u64,
    /// Timeout assigned once `requests` admissions have happened
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Breakpoint {
    pub fn new(requests: u64, timeout: Duration) -> Self {
        Self { requests, timeout }
    }
}

/// Escalating lockout table.
///
/// Counts below the first breakpoint form the grace window (timeout zero);
/// from each breakpoint onwards its timeout applies until the next one.
/// Construction rejects tables that would not be monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Breakpoint>", into = "Vec<Breakpoint>")]
pub struct BreakpointPolicy {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointPolicy {
    /// Build a policy from breakpoints ordered by request count.
    pub fn new(breakpoints: Vec<Breakpoint>) -> Result<Self> {
        for pair in breakpoints.windows(2) {
            if pair[1].requests <= pair[0].requests {
                return Err(LimiterError::Config(format!(
                    "breakpoint request counts must be strictly increasing ({} then {})",
                    pair[0].requests, pair[1].requests
                )));
            }
            if pair[1].timeout < pair[0].timeout {
                return Err(LimiterError::Config(format!(
                    "breakpoint timeouts must not decrease ({:?} at {} then {:?} at {})",
                    pair[0].timeout, pair[0].requests, pair[1].timeout, pair[1].requests
                )));
            }
        }
        Ok(Self { breakpoints })
    }

    /// `limit` free admissions, after which every admission locks the key
    /// out for `timeout`.
    pub fn window(limit: u64, timeout: Duration) -> Self {
        Self {
            breakpoints: vec![Breakpoint::new(limit, timeout)],
        }
    }

    /// Load a policy from a YAML list of breakpoints.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse timeout policy: {}", e)))
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading timeout policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }
}

impl Default for BreakpointPolicy {
    /// Two free attempts, then 1 minute, 5 minutes, 1 hour and 24 hours.
    fn default() -> Self {
        Self {
            breakpoints: vec![
                Breakpoint::new(3, MINUTE),
                Breakpoint::new(4, 5 * MINUTE),
                Breakpoint::new(5, HOUR),
                Breakpoint::new(6, DAY),
            ],
        }
    }
}

impl TimeoutPolicy for BreakpointPolicy {
    fn timeout_for(&self, num_requests: u64) -> Duration {
        self.breakpoints
            .iter()
            .take_while(|bp| bp.requests <= num_requests)
            .last()
            .map(|bp| bp.timeout)
            .unwrap_or(Duration::ZERO)
    }
}

impl TryFrom<Vec<Breakpoint>> for BreakpointPolicy {
    type Error = LimiterError;

    fn try_from(breakpoints: Vec<Breakpoint>) -> Result<Self> {
        Self::new(breakpoints)
    }
}

impl From<BreakpointPolicy> for Vec<Breakpoint> {
    fn from(policy: BreakpointPolicy) -> Self {
        policy.breakpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let policy = BreakpointPolicy::default();

        assert_eq!(policy.timeout_for(0), Duration::ZERO);
        assert_eq!(policy.timeout_for(1), Duration::ZERO);
        assert_eq!(policy.timeout_for(2), Duration::ZERO);
        assert_eq!(policy.timeout_for(3), MINUTE);
        assert_eq!(policy.timeout_for(4), 5 * MINUTE);
        assert_eq!(policy.timeout_for(5), HOUR);
        assert_eq!(policy.timeout_for(6), DAY);
        assert_eq!(policy.timeout_for(1_000), DAY);
    }

    #[test]
    fn test_default_table_is_monotonic() {
        let policy = BreakpointPolicy::default();
        let timeouts: Vec<Duration> = (0..20).map(|n| policy.timeout_for(n)).collect();

        assert!(timeouts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_window_policy() {
        let policy = BreakpointPolicy::window(10, 30 * MINUTE);

        assert_eq!(policy.timeout_for(9), Duration::ZERO);
        assert_eq!(policy.timeout_for(10), 30 * MINUTE);
        assert_eq!(policy.timeout_for(11), 30 * MINUTE);
    }

    #[test]
    fn test_rejects_unordered_requests() {
        let result = BreakpointPolicy::new(vec![
            Breakpoint::new(4, MINUTE),
            Breakpoint::new(4, HOUR),
        ]);
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_rejects_decreasing_timeouts() {
        let result = BreakpointPolicy::new(vec![
            Breakpoint::new(3, HOUR),
            Breakpoint::new(4, MINUTE),
        ]);
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_empty_policy_never_penalizes() {
        let policy = BreakpointPolicy::new(Vec::new()).unwrap();
        assert_eq!(policy.timeout_for(u64::MAX), Duration::ZERO);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
- requests: 3
  timeout: 1m
- requests: 4
  timeout: 5m
- requests: 5
  timeout: 1h
- requests: 6
  timeout: 24h
"#;
        let policy = BreakpointPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy, BreakpointPolicy::default());
    }

    #[test]
    fn test_parse_yaml_validates() {
        let yaml = r#"
- requests: 5
  timeout: 1h
- requests: 3
  timeout: 2h
"#;
        assert!(BreakpointPolicy::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_fn_policy() {
        let policy = FnPolicy::new(|n| if n < 2 { Duration::ZERO } else { HOUR });
        assert_eq!(policy.timeout_for(1), Duration::ZERO);
        assert_eq!(policy.timeout_for(2), HOUR);
    }
}
