//! Token Issuer: RS256 access/refresh pairs, the signing key ring and the
//! published JWKS.

pub mod claims;
pub mod error;
pub mod issuer;
pub mod jwks;
pub mod jwt;
pub mod keys;
pub mod ring;
pub mod store;

pub use claims::{JtiPair, TokenClaims, TokenPair, TokenSubject, TokenUse};
pub use error::TokenError;
pub use issuer::TokenIssuer;
pub use jwks::{Jwk, Jwks};
pub use keys::{KeyStatus, SigningKeyRecord};
pub use ring::KeyRing;
pub use store::{KeyStore, MemoryKeyStore, PgKeyStore};
