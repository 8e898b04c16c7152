use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::counter::{AttemptKey, CounterStore, LockoutPolicy};
use super::rate_limit::{EndpointClass, RateLimitDecision, RateLimitPolicy, RateLimitStore};
use crate::error::AuthError;
use crate::store::{StorePolicy, bounded};

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub locked_out: bool,
    pub remaining_ms: i64,
    pub unlock_at: Option<DateTime<Utc>>,
}

/// Brute-Force Guard: per-credential lockout plus per-endpoint rate limits.
///
/// Counters are consulted before any credential is verified; a store outage
/// fails closed.
pub struct BruteForceGuard {
    counters: Arc<dyn CounterStore>,
    limits: Arc<dyn RateLimitStore>,
    lockout: LockoutPolicy,
    rate_limits: RateLimitPolicy,
    policy: StorePolicy,
}

impl BruteForceGuard {
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        limits: Arc<dyn RateLimitStore>,
        lockout: LockoutPolicy,
        rate_limits: RateLimitPolicy,
        policy: StorePolicy,
    ) -> Self {
        Self {
            counters,
            limits,
            lockout,
            rate_limits,
            policy,
        }
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn record_failure(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AuthError> {
        let counters = self.counters.clone();
        let lockout = self.lockout;
        let owned_key = key.clone();
        let counter = bounded(&self.policy, "guard.record_failure", move || {
            let counters = counters.clone();
            let key = owned_key.clone();
            async move { counters.record_failure(&key, &lockout, now).await }
        })
        .await?;

        if counter.count == self.lockout.max_attempts && counter.is_locked(now) {
            warn!(
                purpose = %key.purpose,
                attempts = counter.count,
                locked_until = ?counter.locked_until,
                "credential locked after repeated failures"
            );
        }
        Ok(FailureOutcome {
            attempts: counter.count,
            locked_until: counter.locked_until.filter(|until| *until > now),
        })
    }

    /// A verified success clears the counter.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn record_success(&self, key: &AttemptKey) -> Result<(), AuthError> {
        let counters = self.counters.clone();
        let owned_key = key.clone();
        bounded(&self.policy, "guard.record_success", move || {
            let counters = counters.clone();
            let key = owned_key.clone();
            async move { counters.reset(&key).await }
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn check_lockout(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<LockoutStatus, AuthError> {
        let counters = self.counters.clone();
        let owned_key = key.clone();
        let counter = bounded(&self.policy, "guard.check_lockout", move || {
            let counters = counters.clone();
            let key = owned_key.clone();
            async move { counters.get(&key).await }
        })
        .await?;

        let unlock_at = counter
            .and_then(|c| c.locked_until)
            .filter(|until| *until > now);
        Ok(LockoutStatus {
            locked_out: unlock_at.is_some(),
            remaining_ms: unlock_at.map_or(0, |until| (until - now).num_milliseconds()),
            unlock_at,
        })
    }

    /// Fail with [`AuthError::AccountLocked`] while `key` is locked.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AccountLocked`] when locked, or
    /// [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn ensure_not_locked(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        match self.check_lockout(key, now).await?.unlock_at {
            Some(unlock_at) => {
                info!(purpose = %key.purpose, unlock_at = %unlock_at, "rejected attempt on locked credential");
                Err(AuthError::AccountLocked { unlock_at })
            }
            None => Ok(()),
        }
    }

    /// Count one request from `identity` against the limit of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the rate limit store is unreachable.
    pub async fn check_rate_limit(
        &self,
        class: EndpointClass,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AuthError> {
        let limits = self.limits.clone();
        let limit = self.rate_limits.limit_for(class);
        let bucket = format!("{class}:{identity}");
        bounded(&self.policy, "guard.check_rate_limit", move || {
            let limits = limits.clone();
            let bucket = bucket.clone();
            async move { limits.hit(&bucket, &limit, now).await }
        })
        .await
    }

    /// Like [`Self::check_rate_limit`], but a limited request becomes
    /// [`AuthError::RateLimited`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RateLimited`] when over the limit, or
    /// [`AuthError::VerificationUnavailable`] if the store is unreachable.
    pub async fn enforce_rate_limit(
        &self,
        class: EndpointClass,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        match self.check_rate_limit(class, identity, now).await? {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited {
                retry_after_seconds,
            } => {
                info!(class = %class, retry_after_seconds, "request rate limited");
                Err(AuthError::RateLimited {
                    retry_after_seconds,
                })
            }
        }
    }

    /// Failures recorded for `key` inside the current window, for risk scoring.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the counter store is unreachable.
    pub async fn recent_failures(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<u32, AuthError> {
        let counters = self.counters.clone();
        let owned_key = key.clone();
        let window = self.lockout.window;
        let counter = bounded(&self.policy, "guard.recent_failures", move || {
            let counters = counters.clone();
            let key = owned_key.clone();
            async move { counters.get(&key).await }
        })
        .await?;
        Ok(counter
            .filter(|c| now - c.window_start < window || c.is_locked(now))
            .map_or(0, |c| c.count))
    }
}
