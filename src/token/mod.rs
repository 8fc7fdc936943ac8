//! Bearer token verification for the server side of the session.
//!
//! ID tokens are RS256 JWTs issued by the identity provider. The server only
//! holds public verification material (a JWKS); signing is exposed for the
//! in-memory provider and tests.

mod jwks;
mod jwt;

pub use jwks::{Jwk, Jwks};
pub use jwt::{IdTokenClaims, IdTokenHeader, VerificationOptions, sign_rs256, verify_rs256};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
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
    Rsa(#[from] rsa::errors::Error),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("missing subject")]
    MissingSubject,
}
