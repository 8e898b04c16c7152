//! Sliding-window rate limiting for auth endpoints.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Login,
    Refresh,
    MfaVerify,
    BackupCodeVerify,
}

impl EndpointClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Refresh => "refresh",
            Self::MfaVerify => "mfa_verify",
            Self::BackupCodeVerify => "backup_code_verify",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `max_hits` requests per rolling `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub max_hits: u32,
    pub window: Duration,
}

impl RateLimit {
    #[must_use]
    pub fn new(max_hits: u32, window_seconds: i64) -> Self {
        Self {
            max_hits,
            window: Duration::seconds(window_seconds),
        }
    }
}

/// Parses the `HITS/SECONDS` form used on the command line, e.g. `10/60`.
impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hits, seconds) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("expected HITS/SECONDS, got {s}"))?;
        let max_hits: u32 = hits.trim().parse().context("invalid hit count")?;
        let seconds: i64 = seconds.trim().parse().context("invalid window seconds")?;
        if max_hits == 0 || seconds <= 0 {
            return Err(anyhow!("rate limit must be positive, got {s}"));
        }
        Ok(Self::new(max_hits, seconds))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub login: RateLimit,
    pub refresh: RateLimit,
    pub mfa_verify: RateLimit,
    pub backup_code_verify: RateLimit,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            login: RateLimit::new(10, 60),
            refresh: RateLimit::new(30, 60),
            mfa_verify: RateLimit::new(5, 300),
            backup_code_verify: RateLimit::new(3, 900),
        }
    }
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn limit_for(&self, class: EndpointClass) -> RateLimit {
        match class {
            EndpointClass::Login => self.login,
            EndpointClass::Refresh => self.refresh,
            EndpointClass::MfaVerify => self.mfa_verify,
            EndpointClass::BackupCodeVerify => self.backup_code_verify,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Seconds until the oldest hit in the window ages out, at least one.
#[must_use]
pub fn retry_after(oldest_hit: DateTime<Utc>, limit: &RateLimit, now: DateTime<Utc>) -> u64 {
    let remaining = (oldest_hit + limit.window - now).num_milliseconds();
    let seconds = remaining.saturating_add(999) / 1000;
    u64::try_from(seconds.max(1)).unwrap_or(1)
}

/// Sliding-window log keyed by bucket (`class:identity`).
///
/// Rejected requests are not logged, so a client that keeps retrying while
/// limited is not pushed further back.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(&self, bucket: &str, limit: &RateLimit, now: DateTime<Utc>)
    -> Result<RateLimitDecision>;
}

/// Idle buckets are dropped at most this often.
const SWEEP_INTERVAL: Duration = Duration::seconds(60);

#[derive(Debug)]
struct Bucket {
    window: Duration,
    hits: VecDeque<DateTime<Utc>>,
}

impl Bucket {
    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.hits.back().is_none_or(|last| *last <= now - self.window)
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_key: HashMap<String, Bucket>,
    swept_at: Option<DateTime<Utc>>,
}

impl Buckets {
    fn sweep(&mut self, now: DateTime<Utc>) {
        if self.swept_at.is_some_and(|at| now - at < SWEEP_INTERVAL) {
            return;
        }
        self.by_key.retain(|_, bucket| !bucket.is_idle(now));
        self.swept_at = Some(now);
    }
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<Buckets>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets still holding hits.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.by_key.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        bucket: &str,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let mut buckets = self.buckets.lock().await;
        buckets.sweep(now);
        let entry = buckets
            .by_key
            .entry(bucket.to_string())
            .or_insert_with(|| Bucket {
                window: limit.window,
                hits: VecDeque::new(),
            });
        entry.window = limit.window;
        let horizon = now - limit.window;
        while entry.hits.front().is_some_and(|hit| *hit <= horizon) {
            entry.hits.pop_front();
        }

        if entry.hits.len() >= usize::try_from(limit.max_hits).unwrap_or(usize::MAX) {
            let oldest = entry.hits.front().copied().unwrap_or(now);
            return Ok(RateLimitDecision::Limited {
                retry_after_seconds: retry_after(oldest, limit, now),
            });
        }
        entry.hits.push_back(now);
        Ok(RateLimitDecision::Allowed)
    }
}
