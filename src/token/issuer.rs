use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};

use super::claims::{JtiPair, TokenClaims, TokenPair, TokenSubject, TokenUse};
use super::jwks::Jwks;
use super::jwt::{ParsedToken, Validation, sign_rs256};
use super::keys::SigningKeyRecord;
use super::ring::KeyRing;
use super::TokenError;

/// Mints and verifies the access/refresh pair.
///
/// Token verification is purely cryptographic and never touches the session
/// store; binding a token to a live session is the caller's job.
pub struct TokenIssuer {
    keys: Arc<KeyRing>,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        keys: Arc<KeyRing>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            audience: audience.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    #[must_use]
    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    #[must_use]
    pub const fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Sign a new access/refresh pair for `subject` with the active key.
    ///
    /// `refresh_expires_at` is the session expiry the refresh token must carry;
    /// the access token expiry never exceeds it.
    ///
    /// # Errors
    ///
    /// Returns an error if no active key is available or signing fails.
    #[instrument(skip_all, fields(session_id = %subject.session_id))]
    pub async fn mint_pair(
        &self,
        subject: &TokenSubject,
        jtis: &JtiPair,
        refresh_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, TokenError> {
        let key = self.keys.signing_key().await?;
        let access_expires_at = (now + self.access_ttl).min(refresh_expires_at);

        let access = self.claims(subject, &jtis.access_jti, TokenUse::Access, now, access_expires_at);
        let refresh = self.claims(subject, &jtis.refresh_jti, TokenUse::Refresh, now, refresh_expires_at);

        // RSA signing is CPU bound; keep it off the async workers.
        let (access_token, refresh_token) = tokio::task::spawn_blocking(move || {
            let access_token = sign_rs256(&key.signing_key, &key.kid, &access)?;
            let refresh_token = sign_rs256(&key.signing_key, &key.kid, &refresh)?;
            Ok::<_, TokenError>((access_token, refresh_token))
        })
        .await
        .map_err(|err| TokenError::Signing(err.to_string()))??;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: (access_expires_at - now).num_seconds(),
            access_jti: jtis.access_jti.clone(),
            refresh_jti: jtis.refresh_jti.clone(),
            access_expires_at,
            expires_at: refresh_expires_at,
        })
    }

    fn claims(
        &self,
        subject: &TokenSubject,
        jti: &str,
        token_use: TokenUse,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> TokenClaims {
        TokenClaims {
            sub: subject.user_id.clone(),
            jti: jti.to_string(),
            session_id: subject.session_id,
            org_id: subject.org_id.clone(),
            role: subject.role.clone(),
            permissions: subject.permissions.clone(),
            device_fingerprint: subject.device_fingerprint.clone(),
            token_use,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        }
    }

    /// Verify signature and registered claims of a token of `expected_use`.
    ///
    /// # Errors
    ///
    /// Returns the specific [`TokenError`] describing why the token was rejected.
    pub async fn verify(
        &self,
        token: &str,
        expected_use: TokenUse,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, TokenError> {
        let parsed = ParsedToken::parse(token)?;
        let key = self.keys.verification_key(&parsed.header.kid, now).await?;
        parsed.verify(
            &key.verifying_key,
            &Validation {
                issuer: &self.issuer,
                audience: &self.audience,
                token_use: expected_use,
                now_unix_seconds: now.timestamp(),
            },
        )
    }

    /// # Errors
    ///
    /// Returns an error if the keys were never loaded and the store is unreachable.
    pub async fn publish_key_set(&self, now: DateTime<Utc>) -> Result<Jwks, TokenError> {
        self.keys.key_set(now).await
    }

    /// Generate a new active key and retire the current one. The retiring key
    /// stays published for the longest TTL it could have signed.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or the store update fails.
    pub async fn rotate_signing_key(&self, now: DateTime<Utc>) -> anyhow::Result<String> {
        let record = tokio::task::spawn_blocking(move || SigningKeyRecord::generate(now)).await??;
        let kid = record.kid.clone();
        let publish_until = now + self.access_ttl.max(self.refresh_ttl);

        self.keys.store().rotate(record, publish_until).await?;
        self.keys.reload().await?;
        info!(kid = %kid, publish_until = %publish_until, "signing key rotated");
        Ok(kid)
    }

    /// Drop retiring keys whose publication window has closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn prune_keys(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let pruned = self.keys.store().prune(now).await?;
        if pruned > 0 {
            self.keys.reload().await?;
            info!(pruned, "retired signing keys pruned");
        }
        Ok(pruned)
    }
}
