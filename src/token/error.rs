use rsa::errors::Error as RsaError;
use thiserror::Error;

use super::claims::TokenUse;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("expected {expected} token, found {found}")]
    WrongUse { expected: TokenUse, found: TokenUse },
    #[error("no active signing key")]
    NoActiveKey,
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(String),
}
