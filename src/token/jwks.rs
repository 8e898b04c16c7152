use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Public key set served at `/.well-known/jwks.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Field order is part of the published contract; relying parties diff it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub alg: String,
    pub n: String,
    pub e: String,
    pub key_ops: Vec<String>,
}

impl Jwk {
    /// Build a verification-only JWK from an `RsaPublicKey`.
    #[must_use]
    pub fn from_rsa_public_key(public_key: &RsaPublicKey, kid: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_string(),
            key_use: "sig".to_string(),
            kid: kid.into(),
            alg: "RS256".to_string(),
            n: Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be()),
            key_ops: vec!["verify".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::jwt::{TEST_PRIVATE_KEY_PEM, decode_private_key};

    #[test]
    fn serializes_in_published_field_order() -> anyhow::Result<()> {
        let private_key = decode_private_key(TEST_PRIVATE_KEY_PEM.as_bytes())?;
        let jwk = Jwk::from_rsa_public_key(&RsaPublicKey::from(&private_key), "k1");
        let json = serde_json::to_string(&jwk)?;

        let order = ["\"kty\"", "\"use\"", "\"kid\"", "\"alg\"", "\"n\"", "\"e\"", "\"key_ops\""];
        let positions: Vec<usize> = order
            .iter()
            .map(|field| json.find(field).unwrap_or(usize::MAX))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
        assert!(json.contains("\"key_ops\":[\"verify\"]"));
        assert!(json.contains("\"e\":\"AQAB\""));
        Ok(())
    }

}
