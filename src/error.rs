//! Typed failures surfaced by the security core.
//!
//! Every operation on the authentication hot path resolves to one of these
//! variants; storage and wiring errors never leak as untyped failures.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token expired")]
    ExpiredToken,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token audience does not match")]
    WrongAudience,
    #[error("malformed token")]
    MalformedToken,
    #[error("token is not bound to a live session")]
    InvalidToken,
    #[error("session revoked")]
    SessionRevoked,
    #[error("refresh token reuse detected")]
    ReuseDetected,
    #[error("account locked until {unlock_at}")]
    AccountLocked { unlock_at: DateTime<Utc> },
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("verification unavailable: {0}")]
    VerificationUnavailable(String),
}

impl AuthError {
    /// Failures that must render identically to clients so that a detected
    /// token theft cannot be told apart from a plain expiry.
    #[must_use]
    pub const fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::ExpiredToken
                | Self::InvalidSignature
                | Self::WrongAudience
                | Self::MalformedToken
                | Self::InvalidToken
                | Self::SessionRevoked
                | Self::ReuseDetected
        )
    }

    /// Stable machine-readable name used in logs and security events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::ExpiredToken => "expired_token",
            Self::InvalidSignature => "invalid_signature",
            Self::WrongAudience => "wrong_audience",
            Self::MalformedToken => "malformed_token",
            Self::InvalidToken => "invalid_token",
            Self::SessionRevoked => "session_revoked",
            Self::ReuseDetected => "reuse_detected",
            Self::AccountLocked { .. } => "account_locked",
            Self::RateLimited { .. } => "rate_limited",
            Self::VerificationUnavailable(_) => "verification_unavailable",
        }
    }
}

impl AuthError {
    /// Map a failure to mint tokens. Minting happens on our side, so nothing
    /// about it is the client's fault.
    #[must_use]
    pub fn from_signing(err: TokenError) -> Self {
        match err {
            TokenError::KeysUnavailable(reason) => Self::VerificationUnavailable(reason),
            other => Self::VerificationUnavailable(format!("token signing failed: {other}")),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::ExpiredToken,
            TokenError::InvalidSignature | TokenError::UnknownKid(_) => Self::InvalidSignature,
            TokenError::InvalidIssuer | TokenError::InvalidAudience | TokenError::WrongUse { .. } => {
                Self::WrongAudience
            }
            TokenError::NotYetValid => Self::InvalidToken,
            TokenError::KeysUnavailable(reason) => Self::VerificationUnavailable(reason),
            TokenError::NoActiveKey => {
                Self::VerificationUnavailable("no active signing key".to_string())
            }
            TokenError::TokenFormat
            | TokenError::Base64
            | TokenError::Json(_)
            | TokenError::UnsupportedAlg(_)
            | TokenError::KeyParse
            | TokenError::Rsa(_)
            | TokenError::Signing(_) => Self::MalformedToken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenUse;

    #[test]
    fn signing_failures_are_server_side() {
        for err in [
            TokenError::NoActiveKey,
            TokenError::KeyParse,
            TokenError::Signing("boom".to_string()),
            TokenError::KeysUnavailable("store down".to_string()),
        ] {
            let mapped = AuthError::from_signing(err);
            assert!(matches!(mapped, AuthError::VerificationUnavailable(_)));
            assert!(!mapped.is_credential_failure());
        }
    }

    #[test]
    fn token_errors_map_to_taxonomy() {
        assert!(matches!(
            AuthError::from(TokenError::Expired),
            AuthError::ExpiredToken
        ));
        assert!(matches!(
            AuthError::from(TokenError::UnknownKid("k9".to_string())),
            AuthError::InvalidSignature
        ));
        assert!(matches!(
            AuthError::from(TokenError::WrongUse {
                expected: TokenUse::Access,
                found: TokenUse::Refresh,
            }),
            AuthError::WrongAudience
        ));
        assert!(matches!(
            AuthError::from(TokenError::TokenFormat),
            AuthError::MalformedToken
        ));
        assert!(matches!(
            AuthError::from(TokenError::KeysUnavailable("down".to_string())),
            AuthError::VerificationUnavailable(_)
        ));
    }

    #[test]
    fn reuse_is_indistinguishable_from_expiry() {
        assert!(AuthError::ReuseDetected.is_credential_failure());
        assert!(AuthError::ExpiredToken.is_credential_failure());
        assert!(
            !AuthError::RateLimited {
                retry_after_seconds: 1
            }
            .is_credential_failure()
        );
        assert!(!AuthError::VerificationUnavailable(String::new()).is_credential_failure());
    }
}
