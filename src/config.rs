//! Runtime configuration for the security core.

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::guard::{LockoutPolicy, RateLimitPolicy};
use crate::incident::IncidentPolicy;
use crate::risk::RiskConfig;
use crate::store::StorePolicy;

pub const DEFAULT_ISSUER: &str = "https://api.truxe.io";
pub const DEFAULT_AUDIENCE: &str = "truxe-api";

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    session_max_lifetime: Duration,
    key_refresh_interval: StdDuration,
    store: StorePolicy,
    session_gc_grace: Duration,
    session_gc_interval: StdDuration,
    max_sessions_per_user: Option<usize>,
    lockout: LockoutPolicy,
    rate_limits: RateLimitPolicy,
    risk: RiskConfig,
    incident: IncidentPolicy,
    notification_buffer: usize,
}

impl CoreConfig {
    /// Defaults: 15 minute access tokens, 30 day refresh tokens, 90 day
    /// absolute session lifetime, 60 s key cache, 2 s store timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(30),
            session_max_lifetime: Duration::days(90),
            key_refresh_interval: StdDuration::from_secs(60),
            store: StorePolicy::default(),
            session_gc_grace: Duration::days(7),
            session_gc_interval: StdDuration::from_secs(3600),
            max_sessions_per_user: None,
            lockout: LockoutPolicy::default(),
            rate_limits: RateLimitPolicy::default(),
            risk: RiskConfig::default(),
            incident: IncidentPolicy::default(),
            notification_buffer: 1024,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_session_max_lifetime_seconds(mut self, seconds: i64) -> Self {
        self.session_max_lifetime = Duration::seconds(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_key_refresh_interval_seconds(mut self, seconds: u64) -> Self {
        self.key_refresh_interval = StdDuration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_store_policy(mut self, store: StorePolicy) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_session_gc_grace_seconds(mut self, seconds: i64) -> Self {
        self.session_gc_grace = Duration::seconds(seconds.max(0));
        self
    }

    #[must_use]
    pub fn with_session_gc_interval_seconds(mut self, seconds: u64) -> Self {
        self.session_gc_interval = StdDuration::from_secs(seconds.max(1));
        self
    }

    /// `None` or zero disables the per-user session limit.
    #[must_use]
    pub fn with_max_sessions_per_user(mut self, max: Option<usize>) -> Self {
        self.max_sessions_per_user = max.filter(|max| *max > 0);
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutPolicy) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, rate_limits: RateLimitPolicy) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    #[must_use]
    pub fn with_risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    #[must_use]
    pub fn with_incident_policy(mut self, incident: IncidentPolicy) -> Self {
        self.incident = incident;
        self
    }

    #[must_use]
    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity.max(1);
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub const fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub const fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub const fn session_max_lifetime(&self) -> Duration {
        self.session_max_lifetime
    }

    #[must_use]
    pub const fn key_refresh_interval(&self) -> StdDuration {
        self.key_refresh_interval
    }

    #[must_use]
    pub const fn store_policy(&self) -> StorePolicy {
        self.store
    }

    #[must_use]
    pub const fn session_gc_grace(&self) -> Duration {
        self.session_gc_grace
    }

    #[must_use]
    pub const fn session_gc_interval(&self) -> StdDuration {
        self.session_gc_interval
    }

    #[must_use]
    pub const fn max_sessions_per_user(&self) -> Option<usize> {
        self.max_sessions_per_user
    }

    #[must_use]
    pub const fn lockout(&self) -> LockoutPolicy {
        self.lockout
    }

    #[must_use]
    pub const fn rate_limits(&self) -> &RateLimitPolicy {
        &self.rate_limits
    }

    #[must_use]
    pub const fn risk(&self) -> &RiskConfig {
        &self.risk
    }

    #[must_use]
    pub const fn incident_policy(&self) -> IncidentPolicy {
        self.incident
    }

    #[must_use]
    pub const fn notification_buffer(&self) -> usize {
        self.notification_buffer
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoreConfig::new();
        assert_eq!(config.issuer(), "https://api.truxe.io");
        assert_eq!(config.audience(), "truxe-api");
        assert_eq!(config.access_ttl(), Duration::minutes(15));
        assert_eq!(config.refresh_ttl(), Duration::days(30));
        assert_eq!(config.session_gc_grace(), Duration::days(7));
        assert_eq!(config.lockout().max_attempts, 5);
        assert_eq!(config.risk().suspicious_threshold, 50);
        assert!((config.risk().travel.max_speed_kmh - 900.0).abs() < f64::EPSILON);
        assert_eq!(config.max_sessions_per_user(), None);
    }

    #[test]
    fn builder_clamps_nonsense() {
        let config = CoreConfig::new()
            .with_access_ttl_seconds(0)
            .with_max_sessions_per_user(Some(0))
            .with_notification_buffer(0);
        assert_eq!(config.access_ttl(), Duration::seconds(1));
        assert_eq!(config.max_sessions_per_user(), None);
        assert_eq!(config.notification_buffer(), 1);

        let config = config.with_max_sessions_per_user(Some(3));
        assert_eq!(config.max_sessions_per_user(), Some(3));
    }
}
