//! Brute-Force Guard: failed-attempt lockout and endpoint rate limits.

pub mod brute_force;
pub mod counter;
pub mod postgres;
pub mod rate_limit;

pub use brute_force::{BruteForceGuard, FailureOutcome, LockoutStatus};
pub use counter::{AttemptKey, AttemptPurpose, CounterStore, LockoutPolicy, MemoryCounterStore};
pub use postgres::{PgCounterStore, PgRateLimitStore};
pub use rate_limit::{
    EndpointClass, MemoryRateLimitStore, RateLimit, RateLimitDecision, RateLimitPolicy,
    RateLimitStore,
};
