use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::Instrument;

use super::keys::{KeyStatus, SigningKeyRecord};

/// Durable home of the signing keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// All keys that have not been pruned, active first.
    async fn load(&self) -> Result<Vec<SigningKeyRecord>>;

    /// Demote the current active key to `retiring` (published until
    /// `retire_publish_until`) and store `key` as the new active key, atomically.
    async fn rotate(
        &self,
        key: SigningKeyRecord,
        retire_publish_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete retiring keys whose publication window has closed.
    async fn prune(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<Vec<SigningKeyRecord>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing record.
    pub async fn insert(&self, record: SigningKeyRecord) {
        self.keys.write().await.push(record);
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Vec<SigningKeyRecord>> {
        let mut keys = self.keys.read().await.clone();
        keys.sort_by_key(|k| (k.status != KeyStatus::Active, std::cmp::Reverse(k.created_at)));
        Ok(keys)
    }

    async fn rotate(
        &self,
        key: SigningKeyRecord,
        retire_publish_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut keys = self.keys.write().await;
        for existing in keys.iter_mut().filter(|k| k.status == KeyStatus::Active) {
            existing.status = KeyStatus::Retiring;
            existing.publish_until = Some(retire_publish_until);
        }
        keys.push(SigningKeyRecord {
            status: KeyStatus::Active,
            publish_until: None,
            ..key
        });
        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|k| k.is_published(now));
        Ok(u64::try_from(before - keys.len()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn load(&self) -> Result<Vec<SigningKeyRecord>> {
        let query = r"
            SELECT kid, private_key_pem, status, created_at, publish_until
            FROM signing_keys
            ORDER BY (status = 'active') DESC, created_at DESC
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load signing keys")?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(SigningKeyRecord {
                    kid: row.get("kid"),
                    private_key_pem: SecretString::from(row.get::<String, _>("private_key_pem")),
                    status: status.parse()?,
                    created_at: row.get("created_at"),
                    publish_until: row.get("publish_until"),
                })
            })
            .collect()
    }

    async fn rotate(
        &self,
        key: SigningKeyRecord,
        retire_publish_until: DateTime<Utc>,
    ) -> Result<()> {
        let (n, e) = key.public_components()?;
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let demote = r"
            UPDATE signing_keys
            SET status = 'retiring', publish_until = $1
            WHERE status = 'active'
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = demote
        );
        sqlx::query(demote)
            .bind(retire_publish_until)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to retire active signing key")?;

        let insert = r"
            INSERT INTO signing_keys
                (kid, algorithm, private_key_pem, public_n, public_e, status, created_at)
            VALUES ($1, 'RS256', $2, $3, $4, 'active', $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = insert
        );
        sqlx::query(insert)
            .bind(&key.kid)
            .bind(key.private_key_pem.expose_secret())
            .bind(n)
            .bind(e)
            .bind(key.created_at)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert signing key")?;

        tx.commit().await.context("failed to commit key rotation")?;
        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = r"
            DELETE FROM signing_keys
            WHERE status = 'retiring' AND (publish_until IS NULL OR publish_until <= $1)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to prune signing keys")?;
        Ok(result.rows_affected())
    }
}
