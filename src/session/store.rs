use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{RevokeReason, Session, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated,
    /// The stored refresh JTI no longer matched, or the session is not active.
    Conflict,
}

/// Replacement identifiers written by a successful refresh.
#[derive(Debug, Clone)]
pub struct JtiRotation<'a> {
    pub expected_refresh_jti: &'a str,
    pub new_access_jti: &'a str,
    pub new_refresh_jti: &'a str,
    pub new_expires_at: DateTime<Utc>,
}

/// Durable session storage.
///
/// `rotate_jtis` is the linearization point for refresh: it must be a single
/// conditional write so that, of two concurrent callers presenting the same
/// refresh JTI, exactly one sees [`RotateOutcome::Rotated`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>>;

    /// Look up by either the current access or the current refresh JTI.
    async fn get_by_jti(&self, jti: &str) -> Result<Option<Session>>;

    /// Returns `true` only when the session transitioned to revoked.
    async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn rotate_jtis(
        &self,
        session_id: Uuid,
        rotation: &JtiRotation<'_>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome>;

    /// Sessions of `user_id` created at or after `since`, newest first.
    async fn list_for_user(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Session>>;

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Delete sessions that expired (or were revoked) before `before`.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Session>,
    by_jti: HashMap<String, Uuid>,
}

/// Single-process store used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.session_id)
            || state.by_jti.contains_key(&session.access_jti)
            || state.by_jti.contains_key(&session.refresh_jti)
        {
            bail!("duplicate session or jti");
        }
        state
            .by_jti
            .insert(session.access_jti.clone(), session.session_id);
        state
            .by_jti
            .insert(session.refresh_jti.clone(), session.session_id);
        state.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn get_by_jti(&self, jti: &str) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .by_jti
            .get(jti)
            .and_then(|id| state.sessions.get(id))
            .cloned())
    }

    async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.status = SessionStatus::Revoked;
                session.revoked_reason = Some(reason);
                session.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for session in state
            .sessions
            .values_mut()
            .filter(|s| s.user_id == user_id && s.status == SessionStatus::Active)
        {
            session.status = SessionStatus::Revoked;
            session.revoked_reason = Some(reason);
            session.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn rotate_jtis(
        &self,
        session_id: Uuid,
        rotation: &JtiRotation<'_>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(RotateOutcome::Conflict);
        };
        if session.status != SessionStatus::Active
            || session.refresh_jti != rotation.expected_refresh_jti
        {
            return Ok(RotateOutcome::Conflict);
        }

        state.by_jti.remove(&session.access_jti);
        state.by_jti.remove(&session.refresh_jti);
        session.access_jti = rotation.new_access_jti.to_string();
        session.refresh_jti = rotation.new_refresh_jti.to_string();
        session.expires_at = rotation.new_expires_at;
        session.last_used_at = now;
        state
            .by_jti
            .insert(session.access_jti.clone(), session_id);
        state
            .by_jti
            .insert(session.refresh_jti.clone(), session_id);
        Ok(RotateOutcome::Rotated)
    }

    async fn list_for_user(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Session>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.created_at >= since)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(session) = self.state.lock().await.sessions.get_mut(&session_id) {
            session.last_used_at = session.last_used_at.max(now);
        }
        Ok(())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let doomed: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| {
                s.expires_at < before || s.revoked_at.is_some_and(|at| at < before)
            })
            .map(|s| s.session_id)
            .collect();
        for id in &doomed {
            if let Some(session) = state.sessions.remove(id) {
                state.by_jti.remove(&session.access_jti);
                state.by_jti.remove(&session.refresh_jti);
            }
        }
        Ok(u64::try_from(doomed.len()).unwrap_or(u64::MAX))
    }
}

/// Memory store with switchable faults for exercising the registry's
/// failure paths.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FaultySessionStore {
    inner: MemorySessionStore,
    /// Reads never complete.
    pub stall_reads: std::sync::atomic::AtomicBool,
    /// Revocations fail outright.
    pub fail_revokes: std::sync::atomic::AtomicBool,
    /// `rotate_jtis` commits but reports `Conflict`, as if the reply to the
    /// first attempt was lost and only the retry was answered.
    pub lose_rotate_reply: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FaultySessionStore {
    async fn stall_if_set(&self) {
        if self.stall_reads.load(std::sync::atomic::Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn check_revokes(&self) -> Result<()> {
        if self.fail_revokes.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("session store rejected the revocation");
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl SessionStore for FaultySessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        self.inner.insert(session).await
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.stall_if_set().await;
        self.inner.get(session_id).await
    }

    async fn get_by_jti(&self, jti: &str) -> Result<Option<Session>> {
        self.stall_if_set().await;
        self.inner.get_by_jti(jti).await
    }

    async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_revokes()?;
        self.inner.revoke(session_id, reason, now).await
    }

    async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_revokes()?;
        self.inner.revoke_all(user_id, reason, now).await
    }

    async fn rotate_jtis(
        &self,
        session_id: Uuid,
        rotation: &JtiRotation<'_>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        let outcome = self.inner.rotate_jtis(session_id, rotation, now).await?;
        if self.lose_rotate_reply.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(RotateOutcome::Conflict);
        }
        Ok(outcome)
    }

    async fn list_for_user(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Session>> {
        self.stall_if_set().await;
        self.inner.list_for_user(user_id, since).await
    }

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.inner.touch(session_id, now).await
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_expired(before).await
    }
}
