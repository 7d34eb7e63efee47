//! Rate limiting logic and state management.

mod clock;
mod composite;
mod limiter;
mod policy;
mod state;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock};
pub use composite::{PhoneIpRateLimiter, DEFAULT_FAILURE_PENALTY, IP_NAMESPACE, PHONE_NAMESPACE};
pub use limiter::RateLimiter;
pub use policy::{Breakpoint, BreakpointPolicy, FnPolicy, TimeoutPolicy};
pub use state::{ClientState, Decision};
pub use storage::{ClientTransaction, MemoryStorage, RateLimiterStorage, RedisStorage};
