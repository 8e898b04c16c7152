//! Failed-attempt counters and the lockout policy applied to them.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// What the failed attempts were guessing at; counters never mix purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptPurpose {
    Password,
    MagicLink,
    Mfa,
    BackupCode,
}

impl AttemptPurpose {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::MagicLink => "magic_link",
            Self::Mfa => "mfa",
            Self::BackupCode => "backup_code",
        }
    }
}

impl fmt::Display for AttemptPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential identifier (or client address) scoped to one purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub subject: String,
    pub purpose: AttemptPurpose,
}

impl AttemptKey {
    #[must_use]
    pub fn new(subject: impl Into<String>, purpose: AttemptPurpose) -> Self {
        Self {
            subject: subject.into(),
            purpose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::minutes(15),
            lockout: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttemptCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl FailedAttemptCounter {
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Fold one more failure into `existing`.
///
/// A live lockout is left untouched, so hammering a locked account never
/// pushes `locked_until` further out. A window that has elapsed (or a lockout
/// that has ended) starts the count over.
#[must_use]
pub fn apply_failure(
    existing: Option<&FailedAttemptCounter>,
    policy: &LockoutPolicy,
    now: DateTime<Utc>,
) -> FailedAttemptCounter {
    match existing {
        Some(counter) if counter.is_locked(now) => counter.clone(),
        Some(counter) if counter.locked_until.is_none() && now - counter.window_start < policy.window => {
            let count = counter.count.saturating_add(1);
            FailedAttemptCounter {
                count,
                window_start: counter.window_start,
                locked_until: (count >= policy.max_attempts).then(|| now + policy.lockout),
            }
        }
        _ => FailedAttemptCounter {
            count: 1,
            window_start: now,
            locked_until: (policy.max_attempts <= 1).then(|| now + policy.lockout),
        },
    }
}

/// Storage for failed-attempt counters.
///
/// `record_failure` must read, apply and write atomically per key so
/// concurrent failures are all counted.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn record_failure(
        &self,
        key: &AttemptKey,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailedAttemptCounter>;

    async fn get(&self, key: &AttemptKey) -> Result<Option<FailedAttemptCounter>>;

    async fn reset(&self, key: &AttemptKey) -> Result<()>;
}

/// Stale counters are dropped at most this often.
const SWEEP_INTERVAL: Duration = Duration::seconds(60);

#[derive(Debug)]
struct Entry {
    counter: FailedAttemptCounter,
    window: Duration,
}

impl Entry {
    /// Neither locked nor inside its window: nothing reads it any more.
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.counter.is_locked(now) && now - self.counter.window_start >= self.window
    }
}

#[derive(Debug, Default)]
struct Counters {
    by_key: HashMap<AttemptKey, Entry>,
    swept_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<Counters>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters currently held.
    pub async fn counter_count(&self) -> usize {
        self.counters.lock().await.by_key.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_failure(
        &self,
        key: &AttemptKey,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailedAttemptCounter> {
        let mut counters = self.counters.lock().await;
        if counters.swept_at.is_none_or(|at| now - at >= SWEEP_INTERVAL) {
            counters.by_key.retain(|_, entry| !entry.is_stale(now));
            counters.swept_at = Some(now);
        }

        let next = apply_failure(counters.by_key.get(key).map(|e| &e.counter), policy, now);
        counters.by_key.insert(
            key.clone(),
            Entry {
                counter: next.clone(),
                window: policy.window,
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &AttemptKey) -> Result<Option<FailedAttemptCounter>> {
        Ok(self
            .counters
            .lock()
            .await
            .by_key
            .get(key)
            .map(|entry| entry.counter.clone()))
    }

    async fn reset(&self, key: &AttemptKey) -> Result<()> {
        self.counters.lock().await.by_key.remove(key);
        Ok(())
    }
}
