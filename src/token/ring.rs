use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::TokenError;
use super::jwks::Jwks;
use super::keys::{KeyStatus, LoadedKey};
use super::store::KeyStore;
use crate::store::{StorePolicy, bounded};

/// Minimum spacing between forced reloads triggered by unknown `kid`s.
const UNKNOWN_KID_COOLDOWN_SECONDS: i64 = 10;

/// Parsed keys as of the last successful load.
#[derive(Debug, Default)]
pub struct KeySnapshot {
    keys: Vec<Arc<LoadedKey>>,
}

impl KeySnapshot {
    fn published(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Arc<LoadedKey>> {
        self.keys.iter().filter(move |key| match key.status {
            KeyStatus::Active => true,
            KeyStatus::Retiring => key.publish_until.is_some_and(|until| until > now),
        })
    }

    #[must_use]
    pub fn active(&self) -> Option<&Arc<LoadedKey>> {
        self.keys.iter().find(|key| key.status == KeyStatus::Active)
    }

    /// Verification only honors keys that are still published.
    #[must_use]
    pub fn find(&self, kid: &str, now: DateTime<Utc>) -> Option<&Arc<LoadedKey>> {
        self.published(now).find(|key| key.kid == kid)
    }

    #[must_use]
    pub fn jwks(&self, now: DateTime<Utc>) -> Jwks {
        Jwks {
            keys: self.published(now).map(|key| key.jwk.clone()).collect(),
        }
    }
}

#[derive(Debug)]
struct KeyCache {
    snapshot: Arc<KeySnapshot>,
    fetched_at: Instant,
}

/// In-process cache of the signing keys held by a [`KeyStore`].
///
/// A stale cache triggers a reload; if the reload fails the last known keys
/// keep serving so verification survives a store blip. With no cache at all
/// the ring fails closed.
pub struct KeyRing {
    store: Arc<dyn KeyStore>,
    policy: StorePolicy,
    refresh_interval: Duration,
    cache: RwLock<Option<KeyCache>>,
    last_forced_reload_unix: AtomicI64,
}

impl KeyRing {
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, policy: StorePolicy, refresh_interval: Duration) -> Self {
        Self {
            store,
            policy,
            refresh_interval,
            cache: RwLock::new(None),
            last_forced_reload_unix: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Return the current snapshot, reloading it when stale.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeysUnavailable`] if the keys were never loaded and
    /// the store cannot be reached.
    pub async fn snapshot(&self) -> Result<Arc<KeySnapshot>, TokenError> {
        let cached = {
            let cache = self.cache.read().await;
            cache.as_ref().map(|c| {
                (
                    c.snapshot.clone(),
                    c.fetched_at.elapsed() < self.refresh_interval,
                )
            })
        };

        match cached {
            Some((snapshot, true)) => Ok(snapshot),
            Some((stale, false)) => match self.reload().await {
                Ok(snapshot) => Ok(snapshot),
                Err(err) => {
                    warn!(error = %err, "failed to refresh signing key cache; serving stale keys");
                    Ok(stale)
                }
            },
            None => self.reload().await,
        }
    }

    /// Load the keys from the store and replace the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeysUnavailable`] if the store cannot be read.
    pub async fn reload(&self) -> Result<Arc<KeySnapshot>, TokenError> {
        let store = self.store.clone();
        let records = bounded(&self.policy, "signing_keys.load", || {
            let store = store.clone();
            async move { store.load().await }
        })
        .await
        .map_err(|err| TokenError::KeysUnavailable(err.to_string()))?;

        let mut keys = Vec::with_capacity(records.len());
        for record in &records {
            match record.load() {
                Ok(key) => keys.push(Arc::new(key)),
                Err(err) => error!(kid = %record.kid, error = %err, "skipping unusable signing key"),
            }
        }

        let snapshot = Arc::new(KeySnapshot { keys });
        info!(keys = snapshot.keys.len(), "signing key cache refreshed");
        *self.cache.write().await = Some(KeyCache {
            snapshot: snapshot.clone(),
            fetched_at: Instant::now(),
        });
        Ok(snapshot)
    }

    /// The key new tokens are signed with.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NoActiveKey`] when the store holds no active key.
    pub async fn signing_key(&self) -> Result<Arc<LoadedKey>, TokenError> {
        self.snapshot()
            .await?
            .active()
            .cloned()
            .ok_or(TokenError::NoActiveKey)
    }

    /// Resolve a verification key by `kid`, reloading once (subject to a
    /// cooldown) when the `kid` is not cached yet.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::UnknownKid`] if no published key matches.
    pub async fn verification_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<LoadedKey>, TokenError> {
        if let Some(key) = self.snapshot().await?.find(kid, now) {
            return Ok(key.clone());
        }

        let now_unix = now.timestamp();
        let last = self.last_forced_reload_unix.load(Ordering::Relaxed);
        if now_unix.saturating_sub(last) < UNKNOWN_KID_COOLDOWN_SECONDS {
            warn!(kid = %kid, "unknown signing key id and reload suppressed");
            return Err(TokenError::UnknownKid(kid.to_string()));
        }
        self.last_forced_reload_unix.store(now_unix, Ordering::Relaxed);

        self.reload()
            .await?
            .find(kid, now)
            .cloned()
            .ok_or_else(|| TokenError::UnknownKid(kid.to_string()))
    }

    /// The public key set: the active key plus retiring keys still inside
    /// their publication window.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeysUnavailable`] if keys were never loaded.
    pub async fn key_set(&self, now: DateTime<Utc>) -> Result<Jwks, TokenError> {
        Ok(self.snapshot().await?.jwks(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::keys::test_record;
    use crate::token::store::MemoryKeyStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicBool;

    use crate::token::keys::SigningKeyRecord;

    /// Store that can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryKeyStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl KeyStore for FlakyStore {
        async fn load(&self) -> Result<Vec<SigningKeyRecord>> {
            if self.down.load(Ordering::Relaxed) {
                anyhow::bail!("store offline");
            }
            self.inner.load().await
        }

        async fn rotate(&self, key: SigningKeyRecord, until: DateTime<Utc>) -> Result<()> {
            self.inner.rotate(key, until).await
        }

        async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.prune(now).await
        }
    }

    fn policy() -> StorePolicy {
        StorePolicy::new(
            std::time::Duration::from_millis(200),
            std::time::Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn serves_stale_keys_when_store_is_down() -> Result<()> {
        let store = Arc::new(FlakyStore::default());
        store
            .inner
            .insert(test_record("k1", KeyStatus::Active, Utc::now()))
            .await;
        let ring = KeyRing::new(store.clone(), policy(), Duration::ZERO);

        assert_eq!(ring.signing_key().await?.kid, "k1");

        store.down.store(true, Ordering::Relaxed);
        assert_eq!(ring.signing_key().await?.kid, "k1");
        Ok(())
    }

    #[tokio::test]
    async fn fails_closed_without_cache() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::Relaxed);
        let ring = KeyRing::new(store, policy(), Duration::from_secs(60));

        assert!(matches!(
            ring.signing_key().await,
            Err(TokenError::KeysUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kid_forces_reload() -> Result<()> {
        let now = Utc::now();
        let store = Arc::new(MemoryKeyStore::new());
        store.insert(test_record("k1", KeyStatus::Active, now)).await;
        let ring = KeyRing::new(store.clone(), policy(), Duration::from_secs(3600));
        ring.snapshot().await?;

        store
            .rotate(
                test_record("k2", KeyStatus::Active, now),
                now + ChronoDuration::minutes(15),
            )
            .await?;

        let key = ring.verification_key("k2", now).await?;
        assert_eq!(key.kid, "k2");

        // Cooldown holds the second forced reload back.
        assert!(matches!(
            ring.verification_key("k3", now).await,
            Err(TokenError::UnknownKid(kid)) if kid == "k3"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reload_cooldown_follows_the_given_clock() -> Result<()> {
        use chrono::TimeZone;

        let now = Utc
            .with_ymd_and_hms(2026, 1, 5, 12, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("bad timestamp"))?;
        let store = Arc::new(MemoryKeyStore::new());
        store.insert(test_record("k1", KeyStatus::Active, now)).await;
        let ring = KeyRing::new(store.clone(), policy(), Duration::from_secs(3600));

        assert!(ring.verification_key("k2", now).await.is_err());
        store
            .rotate(
                test_record("k2", KeyStatus::Active, now),
                now + ChronoDuration::minutes(15),
            )
            .await?;

        let within = now + ChronoDuration::seconds(UNKNOWN_KID_COOLDOWN_SECONDS - 1);
        assert!(matches!(
            ring.verification_key("k2", within).await,
            Err(TokenError::UnknownKid(_))
        ));

        let after = now + ChronoDuration::seconds(UNKNOWN_KID_COOLDOWN_SECONDS);
        assert_eq!(ring.verification_key("k2", after).await?.kid, "k2");
        Ok(())
    }

    #[tokio::test]
    async fn key_set_drops_retiring_keys_after_window() -> Result<()> {
        let now = Utc::now();
        let store = Arc::new(MemoryKeyStore::new());
        store.insert(test_record("k1", KeyStatus::Active, now)).await;
        store
            .rotate(
                test_record("k2", KeyStatus::Active, now),
                now + ChronoDuration::minutes(15),
            )
            .await?;
        let ring = KeyRing::new(store, policy(), Duration::from_secs(3600));

        let kids: Vec<String> = ring.key_set(now).await?.keys.into_iter().map(|k| k.kid).collect();
        assert_eq!(kids, vec!["k2".to_string(), "k1".to_string()]);

        let later = now + ChronoDuration::minutes(16);
        let kids: Vec<String> = ring.key_set(later).await?.keys.into_iter().map(|k| k.kid).collect();
        assert_eq!(kids, vec!["k2".to_string()]);
        assert!(ring.verification_key("k1", later).await.is_err());
        Ok(())
    }
}
