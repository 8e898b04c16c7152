use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Distinguishes the two halves of a token pair; a token is only ever
/// accepted where its own use is expected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Refresh,
}

impl TokenUse {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl TokenHeader {
    pub(crate) fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String,
    pub jti: String,
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    pub device_fingerprint: String,
    pub token_use: TokenUse,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Identity and authorization context baked into both tokens of a pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: String,
    pub session_id: Uuid,
    pub org_id: Option<String>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
    pub device_fingerprint: String,
}

impl TokenSubject {
    /// Rebuild the subject from previously verified claims, keeping the
    /// session binding intact across a refresh.
    #[must_use]
    pub fn from_claims(claims: &TokenClaims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            session_id: claims.session_id,
            org_id: claims.org_id.clone(),
            role: claims.role.clone(),
            permissions: claims.permissions.clone(),
            device_fingerprint: claims.device_fingerprint.clone(),
        }
    }
}

/// Pre-allocated token identifiers. Allocated before minting so the
/// session can be bound (or rotated) to them first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JtiPair {
    pub access_jti: String,
    pub refresh_jti: String,
}

impl JtiPair {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            access_jti: Uuid::new_v4().to_string(),
            refresh_jti: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub access_jti: String,
    pub refresh_jti: String,
    pub access_expires_at: DateTime<Utc>,
    /// Refresh token expiry, which is also the session expiry.
    pub expires_at: DateTime<Utc>,
}
