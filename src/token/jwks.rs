use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use super::Error;

/// Public verification material published by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// # Errors
    /// Returns an error if `raw` is not a `{"keys": [...]}` document.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid == kid)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The single-key set matching a signing key. Used by the in-memory provider.
    ///
    /// # Errors
    /// Returns an error if the key is not a PKCS#1 or PKCS#8 RSA key.
    pub fn from_rsa_private_key_pem_or_der(
        signing_key: &[u8],
        kid: impl Into<String>,
    ) -> Result<Self, Error> {
        let public_key = RsaPublicKey::from(&decode_private_key(signing_key)?);
        Ok(Self {
            keys: vec![Jwk::from_rsa_public_key(&public_key, kid)],
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub n: String,
    pub e: String,
}

impl Jwk {
    #[must_use]
    pub fn from_rsa_public_key(public_key: &RsaPublicKey, kid: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            kid: kid.into(),
            n: Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be()),
        }
    }

    /// # Errors
    /// Returns an error for non-RSA keys or a malformed modulus or exponent.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, Error> {
        if self.kty != "RSA" {
            return Err(Error::KeyParse);
        }
        let component = |value: &str| {
            Base64UrlUnpadded::decode_vec(value)
                .map(|bytes| BigUint::from_bytes_be(&bytes))
                .map_err(|_| Error::Base64)
        };
        RsaPublicKey::new(component(&self.n)?, component(&self.e)?).map_err(Error::Rsa)
    }
}

/// PEM text or DER bytes, PKCS#8 or PKCS#1.
pub(super) fn decode_private_key(encoded: &[u8]) -> Result<RsaPrivateKey, Error> {
    let key = match std::str::from_utf8(encoded) {
        Ok(text) if text.trim_start().starts_with("-----BEGIN") => {
            RsaPrivateKey::from_pkcs8_pem(text)
                .ok()
                .or_else(|| RsaPrivateKey::from_pkcs1_pem(text).ok())
        }
        _ => RsaPrivateKey::from_pkcs8_der(encoded)
            .ok()
            .or_else(|| RsaPrivateKey::from_pkcs1_der(encoded).ok()),
    };
    key.ok_or(Error::KeyParse)
}
