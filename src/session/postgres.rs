use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::model::{DeviceInfo, RevokeReason, Session};
use super::store::{JtiRotation, RotateOutcome, SessionStore};
use crate::risk::geo::GeoPoint;

const SESSION_COLUMNS: &str = r"
    session_id, user_id, org_id, device_ip, device_user_agent, device_fingerprint,
    device_latitude, device_longitude, device_country, device_city,
    created_at, last_used_at, expires_at, access_jti, refresh_jti,
    status, revoked_reason, revoked_at
";

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let ip: Option<IpNetwork> = row.get("device_ip");
    let latitude: Option<f64> = row.get("device_latitude");
    let longitude: Option<f64> = row.get("device_longitude");
    let location = latitude.zip(longitude).map(|(latitude, longitude)| GeoPoint {
        latitude,
        longitude,
        country: row.get("device_country"),
        city: row.get("device_city"),
    });
    let status: String = row.get("status");
    let revoked_reason: Option<String> = row.get("revoked_reason");

    Ok(Session {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        org_id: row.get("org_id"),
        device: DeviceInfo {
            ip: ip.map(|net| net.ip()),
            user_agent: row.get("device_user_agent"),
            fingerprint: row.get("device_fingerprint"),
            location,
        },
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        expires_at: row.get("expires_at"),
        access_jti: row.get("access_jti"),
        refresh_jti: row.get("refresh_jti"),
        status: status.parse()?,
        revoked_reason: revoked_reason.as_deref().map(str::parse).transpose()?,
        revoked_at: row.get("revoked_at"),
    })
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        let query = r"
            INSERT INTO sessions (
                session_id, user_id, org_id, device_ip, device_user_agent, device_fingerprint,
                device_latitude, device_longitude, device_country, device_city,
                created_at, last_used_at, expires_at, access_jti, refresh_jti, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 'active')
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let location = session.device.location.as_ref();
        sqlx::query(query)
            .bind(session.session_id)
            .bind(&session.user_id)
            .bind(&session.org_id)
            .bind(session.device.ip.map(IpNetwork::from))
            .bind(&session.device.user_agent)
            .bind(&session.device.fingerprint)
            .bind(location.map(|l| l.latitude))
            .bind(location.map(|l| l.longitude))
            .bind(location.and_then(|l| l.country.clone()))
            .bind(location.and_then(|l| l.city.clone()))
            .bind(session.created_at)
            .bind(session.last_used_at)
            .bind(session.expires_at)
            .bind(&session.access_jti)
            .bind(&session.refresh_jti)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn get_by_jti(&self, jti: &str) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE access_jti = $1 OR refresh_jti = $1 LIMIT 1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(jti)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch session by jti")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET status = 'revoked', revoked_reason = $2, revoked_at = $3
            WHERE session_id = $1 AND status = 'active'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(reason.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all(
        &self,
        user_id: &str,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE sessions
            SET status = 'revoked', revoked_reason = $2, revoked_at = $3
            WHERE user_id = $1 AND status = 'active'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(reason.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke user sessions")?;
        Ok(result.rows_affected())
    }

    async fn rotate_jtis(
        &self,
        session_id: Uuid,
        rotation: &JtiRotation<'_>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        // Single conditional write: the WHERE clause is the compare, the SET the swap.
        let query = r"
            UPDATE sessions
            SET access_jti = $3, refresh_jti = $4, expires_at = $5, last_used_at = $6
            WHERE session_id = $1 AND refresh_jti = $2 AND status = 'active'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(rotation.expected_refresh_jti)
            .bind(rotation.new_access_jti)
            .bind(rotation.new_refresh_jti)
            .bind(rotation.new_expires_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to rotate session jtis")?;

        Ok(if result.rows_affected() == 1 {
            RotateOutcome::Rotated
        } else {
            RotateOutcome::Conflict
        })
    }

    async fn list_for_user(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 AND created_at >= $2 ORDER BY created_at DESC"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list sessions")?;
        rows.iter().map(session_from_row).collect()
    }

    async fn touch(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let query = r"
            UPDATE sessions SET last_used_at = GREATEST(last_used_at, $2)
            WHERE session_id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to touch session")?;
        Ok(())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = r"
            DELETE FROM sessions
            WHERE expires_at < $1 OR (status = 'revoked' AND revoked_at < $1)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge expired sessions")?;
        Ok(result.rows_affected())
    }
}
