use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{NewSession, RevokeReason, Session};
use super::store::{JtiRotation, RotateOutcome, SessionStore};
use crate::error::AuthError;
use crate::store::{StorePolicy, bounded};

/// Session Registry: the authoritative record of live sessions and the
/// token identifiers currently bound to them.
///
/// Every call goes through [`bounded`], so a slow or unreachable store
/// surfaces as [`AuthError::VerificationUnavailable`] instead of hanging.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    policy: StorePolicy,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, policy: StorePolicy) -> Self {
        Self { store, policy }
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store rejects the insert.
    pub async fn create(
        &self,
        new_session: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let session = new_session.into_session(now);
        let store = self.store.clone();
        let record = session.clone();
        bounded(&self.policy, "sessions.insert", move || {
            let store = store.clone();
            let record = record.clone();
            async move { store.insert(&record).await }
        })
        .await?;
        debug!(session_id = %session.session_id, user_id = %session.user_id, "session created");
        Ok(session)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be read.
    pub async fn get(&self, session_id: Uuid) -> Result<Option<Session>, AuthError> {
        let store = self.store.clone();
        bounded(&self.policy, "sessions.get", move || {
            let store = store.clone();
            async move { store.get(session_id).await }
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be read.
    pub async fn get_by_jti(&self, jti: &str) -> Result<Option<Session>, AuthError> {
        let store = self.store.clone();
        let jti = jti.to_string();
        bounded(&self.policy, "sessions.get_by_jti", move || {
            let store = store.clone();
            let jti = jti.clone();
            async move { store.get_by_jti(&jti).await }
        })
        .await
    }

    /// Idempotent: revoking an already revoked (or missing) session is a no-op
    /// that reports `false`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be updated.
    pub async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let store = self.store.clone();
        let revoked = bounded(&self.policy, "sessions.revoke", move || {
            let store = store.clone();
            async move { store.revoke(session_id, reason, now).await }
        })
        .await?;
        if revoked {
            info!(session_id = %session_id, reason = %reason, "session revoked");
        }
        Ok(revoked)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be updated.
    pub async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64, AuthError> {
        let store = self.store.clone();
        let user = user_id.to_string();
        let revoked = bounded(&self.policy, "sessions.revoke_all", move || {
            let store = store.clone();
            let user = user.clone();
            async move { store.revoke_all(&user, reason, now).await }
        })
        .await?;
        info!(user_id = %user_id, reason = %reason, revoked, "user sessions revoked");
        Ok(revoked)
    }

    /// Compare-and-swap the JTIs bound to `session_id`.
    ///
    /// A conflict is re-checked against the stored row: if it already carries
    /// `new_refresh_jti`, the write landed on an attempt whose reply was lost,
    /// and the rotation counts as ours.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be updated.
    pub async fn rotate_jtis(
        &self,
        session_id: Uuid,
        rotation: &JtiRotation<'_>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, AuthError> {
        let store = self.store.clone();
        let expected = rotation.expected_refresh_jti.to_string();
        let new_access = rotation.new_access_jti.to_string();
        let new_refresh = rotation.new_refresh_jti.to_string();
        let new_expires_at = rotation.new_expires_at;

        let outcome = bounded(&self.policy, "sessions.rotate_jtis", move || {
            let store = store.clone();
            let (expected, new_access, new_refresh) =
                (expected.clone(), new_access.clone(), new_refresh.clone());
            async move {
                let rotation = JtiRotation {
                    expected_refresh_jti: &expected,
                    new_access_jti: &new_access,
                    new_refresh_jti: &new_refresh,
                    new_expires_at,
                };
                store.rotate_jtis(session_id, &rotation, now).await
            }
        })
        .await?;

        if outcome == RotateOutcome::Conflict
            && self
                .get(session_id)
                .await?
                .is_some_and(|s| s.refresh_jti == rotation.new_refresh_jti)
        {
            return Ok(RotateOutcome::Rotated);
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be read.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        let store = self.store.clone();
        let user = user_id.to_string();
        bounded(&self.policy, "sessions.list_for_user", move || {
            let store = store.clone();
            let user = user.clone();
            async move { store.list_for_user(&user, since).await }
        })
        .await
    }

    /// Record activity on a session. Failures are logged, never surfaced.
    pub async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) {
        let store = self.store.clone();
        if let Err(err) = bounded(&self.policy, "sessions.touch", move || {
            let store = store.clone();
            async move { store.touch(session_id, now).await }
        })
        .await
        {
            warn!(session_id = %session_id, error = %err, "failed to touch session");
        }
    }

    /// Remove sessions that ended more than `grace` ago.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be updated.
    pub async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64, AuthError> {
        let store = self.store.clone();
        let before = now - grace;
        bounded(&self.policy, "sessions.purge_expired", move || {
            let store = store.clone();
            async move { store.purge_expired(before).await }
        })
        .await
    }

    /// Keep at most `max_active` live sessions for `user_id` once one more is
    /// opened, revoking the oldest with [`RevokeReason::SessionLimit`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::VerificationUnavailable`] if the store cannot be read or updated.
    pub async fn enforce_session_limit(
        &self,
        user_id: &str,
        max_active: usize,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, AuthError> {
        let active: Vec<Session> = self
            .list_for_user(user_id, now - lookback)
            .await?
            .into_iter()
            .filter(|s| s.is_active(now))
            .collect();

        // Room for the session about to be created.
        let keep = max_active.saturating_sub(1);
        let mut revoked = 0;
        // Newest first, so everything past `keep` is the oldest.
        for session in active.iter().skip(keep) {
            if self
                .revoke(session.session_id, RevokeReason::SessionLimit, now)
                .await?
            {
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{DeviceInfo, SessionStatus};
    use crate::session::store::{FaultySessionStore, MemorySessionStore};
    use std::sync::atomic::Ordering;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemorySessionStore::new()), StorePolicy::default())
    }

    fn new_session(user_id: &str, access: &str, refresh: &str, now: DateTime<Utc>) -> NewSession {
        NewSession {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            org_id: None,
            device: DeviceInfo::default(),
            access_jti: access.to_string(),
            refresh_jti: refresh.to_string(),
            expires_at: now + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn lookup_by_either_jti() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        let session = registry.create(new_session("u1", "a1", "r1", now), now).await?;

        let by_access = registry.get_by_jti("a1").await?;
        let by_refresh = registry.get_by_jti("r1").await?;
        assert_eq!(by_access.map(|s| s.session_id), Some(session.session_id));
        assert_eq!(by_refresh.map(|s| s.session_id), Some(session.session_id));
        assert!(registry.get_by_jti("nope").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rotation_is_compare_and_swap() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        let session = registry.create(new_session("u1", "a1", "r1", now), now).await?;

        let rotation = JtiRotation {
            expected_refresh_jti: "r1",
            new_access_jti: "a2",
            new_refresh_jti: "r2",
            new_expires_at: now + Duration::days(30),
        };
        assert_eq!(
            registry.rotate_jtis(session.session_id, &rotation, now).await?,
            RotateOutcome::Rotated
        );

        let replay = JtiRotation {
            expected_refresh_jti: "r1",
            new_access_jti: "a3",
            new_refresh_jti: "r3",
            new_expires_at: now + Duration::days(30),
        };
        assert_eq!(
            registry.rotate_jtis(session.session_id, &replay, now).await?,
            RotateOutcome::Conflict
        );

        // Old identifiers no longer resolve; the new ones do.
        assert!(registry.get_by_jti("r1").await?.is_none());
        assert!(registry.get_by_jti("a1").await?.is_none());
        assert!(registry.get_by_jti("r2").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn lost_rotate_reply_still_counts_as_rotated() -> anyhow::Result<()> {
        let now = Utc::now();
        let store = Arc::new(FaultySessionStore::default());
        let registry = SessionRegistry::new(store.clone(), StorePolicy::default());
        let session = registry.create(new_session("u1", "a1", "r1", now), now).await?;

        store.lose_rotate_reply.store(true, Ordering::SeqCst);
        let rotation = JtiRotation {
            expected_refresh_jti: "r1",
            new_access_jti: "a2",
            new_refresh_jti: "r2",
            new_expires_at: now + Duration::days(30),
        };
        assert_eq!(
            registry.rotate_jtis(session.session_id, &rotation, now).await?,
            RotateOutcome::Rotated
        );

        // A rival that lost the race is still a conflict.
        let rival = JtiRotation {
            expected_refresh_jti: "r1",
            new_access_jti: "a3",
            new_refresh_jti: "r3",
            new_expires_at: now + Duration::days(30),
        };
        assert_eq!(
            registry.rotate_jtis(session.session_id, &rival, now).await?,
            RotateOutcome::Conflict
        );
        assert_eq!(
            registry.get(session.session_id).await?.map(|s| s.refresh_jti),
            Some("r2".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn stalled_store_fails_closed() -> anyhow::Result<()> {
        let now = Utc::now();
        let store = Arc::new(FaultySessionStore::default());
        let registry = SessionRegistry::new(
            store.clone(),
            StorePolicy::new(
                std::time::Duration::from_millis(20),
                std::time::Duration::from_millis(5),
            ),
        );
        registry.create(new_session("u1", "a1", "r1", now), now).await?;

        store.stall_reads.store(true, Ordering::SeqCst);
        let lookup = registry.get_by_jti("a1").await;
        assert!(matches!(lookup, Err(AuthError::VerificationUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_rotations_have_one_winner() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = Arc::new(registry());
        let session = registry.create(new_session("u1", "a1", "r1", now), now).await?;

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let access = format!("a-{i}");
                let refresh = format!("r-{i}");
                let rotation = JtiRotation {
                    expected_refresh_jti: "r1",
                    new_access_jti: &access,
                    new_refresh_jti: &refresh,
                    new_expires_at: now + Duration::days(30),
                };
                registry.rotate_jtis(session.session_id, &rotation, now).await
            }));
        }

        let mut rotated = 0;
        for handle in handles {
            if handle.await?? == RotateOutcome::Rotated {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_is_idempotent() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        let session = registry.create(new_session("u1", "a1", "r1", now), now).await?;

        assert!(registry.revoke(session.session_id, RevokeReason::UserLogout, now).await?);
        assert!(!registry.revoke(session.session_id, RevokeReason::AdminAction, now).await?);

        let stored = registry.get(session.session_id).await?;
        let stored = stored.ok_or_else(|| anyhow::anyhow!("session missing"))?;
        assert_eq!(stored.status, SessionStatus::Revoked);
        assert_eq!(stored.revoked_reason, Some(RevokeReason::UserLogout));

        let rotation = JtiRotation {
            expected_refresh_jti: "r1",
            new_access_jti: "a2",
            new_refresh_jti: "r2",
            new_expires_at: now + Duration::days(30),
        };
        assert_eq!(
            registry.rotate_jtis(session.session_id, &rotation, now).await?,
            RotateOutcome::Conflict
        );
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_only_touches_one_user() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        registry.create(new_session("u1", "a1", "r1", now), now).await?;
        registry.create(new_session("u1", "a2", "r2", now), now).await?;
        let other = registry.create(new_session("u2", "a3", "r3", now), now).await?;

        assert_eq!(registry.revoke_all("u1", RevokeReason::PasswordReset, now).await?, 2);
        assert_eq!(registry.revoke_all("u1", RevokeReason::PasswordReset, now).await?, 0);
        let other = registry.get(other.session_id).await?;
        assert!(other.is_some_and(|s| s.is_active(now)));
        Ok(())
    }

    #[tokio::test]
    async fn session_limit_revokes_oldest() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        let oldest = registry
            .create(new_session("u1", "a1", "r1", now), now - Duration::hours(3))
            .await?;
        let middle = registry
            .create(new_session("u1", "a2", "r2", now), now - Duration::hours(2))
            .await?;
        let newest = registry
            .create(new_session("u1", "a3", "r3", now), now - Duration::hours(1))
            .await?;

        let revoked = registry
            .enforce_session_limit("u1", 2, Duration::days(90), now)
            .await?;
        assert_eq!(revoked, 2);
        for (session, active) in [(oldest, false), (middle, false), (newest, true)] {
            let stored = registry.get(session.session_id).await?;
            assert_eq!(stored.is_some_and(|s| s.is_active(now)), active);
        }
        Ok(())
    }

    #[tokio::test]
    async fn purge_respects_grace() -> anyhow::Result<()> {
        let now = Utc::now();
        let registry = registry();
        let mut expired = new_session("u1", "a1", "r1", now);
        expired.expires_at = now - Duration::days(10);
        registry.create(expired, now - Duration::days(40)).await?;
        let mut recent = new_session("u1", "a2", "r2", now);
        recent.expires_at = now - Duration::days(1);
        registry.create(recent, now - Duration::days(31)).await?;

        assert_eq!(registry.purge_expired(now, Duration::days(7)).await?, 1);
        assert!(registry.get_by_jti("r1").await?.is_none());
        assert!(registry.get_by_jti("r2").await?.is_some());
        Ok(())
    }
}
