use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::Error;
use super::jwks::{Jwks, decode_private_key};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdTokenHeader {
    pub alg: String,
    #[serde(default)]
    pub typ: Option<String>,
    pub kid: String,
}

impl IdTokenHeader {
    fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: Some("JWT".to_string()),
            kid: kid.into(),
        }
    }
}

/// Claims carried by an identity provider ID token.
///
/// Unknown claims are preserved in `extra` so callers can read provider
/// specific fields without this type having to know about them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a verifier expects of a token besides a valid signature.
#[derive(Debug, Clone)]
pub struct VerificationOptions<'a> {
    pub issuer: &'a str,
    pub audience: &'a str,
    pub now_unix_seconds: i64,
    /// Allowed clock skew for `iat`.
    pub leeway_seconds: i64,
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(Base64UrlUnpadded::encode_string(&serde_json::to_vec(value)?))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, Error> {
    let raw = Base64UrlUnpadded::decode_vec(segment).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// `header.claims.signature`, nothing more and nothing less.
fn split_compact(token: &str) -> Result<(&str, &str, &str), Error> {
    let (signed, signature) = token.rsplit_once('.').ok_or(Error::TokenFormat)?;
    let (header, claims) = signed.split_once('.').ok_or(Error::TokenFormat)?;
    if claims.contains('.') {
        return Err(Error::TokenFormat);
    }
    Ok((header, claims, signature))
}

/// Sign `claims` as a compact RS256 JWT.
///
/// # Errors
/// Returns an error if the signing key cannot be decoded.
pub fn sign_rs256(
    signing_key: &[u8],
    kid: impl Into<String>,
    claims: &IdTokenClaims,
) -> Result<String, Error> {
    let signed = format!(
        "{}.{}",
        encode_segment(&IdTokenHeader::rs256(kid))?,
        encode_segment(claims)?
    );
    let key = SigningKey::<Sha256>::new(decode_private_key(signing_key)?);
    let signature: Signature = key.sign(signed.as_bytes());
    Ok(format!(
        "{signed}.{}",
        Base64UrlUnpadded::encode_string(&signature.to_vec())
    ))
}

/// Check signature and claims of an RS256 ID token against `jwks`.
///
/// # Errors
/// Fails on malformed input, a `kid` missing from `jwks`, a bad signature, or a
/// claim that does not match `options`.
pub fn verify_rs256(
    token: &str,
    jwks: &Jwks,
    options: &VerificationOptions<'_>,
) -> Result<IdTokenClaims, Error> {
    let (header_segment, claims_segment, signature_segment) = split_compact(token)?;

    let header: IdTokenHeader = decode_segment(header_segment)?;
    if header.alg != "RS256" {
        return Err(Error::UnsupportedAlg(header.alg));
    }
    let Some(jwk) = jwks.find_by_kid(&header.kid) else {
        return Err(Error::UnknownKid(header.kid));
    };

    let signature = Base64UrlUnpadded::decode_vec(signature_segment)
        .map_err(|_| Error::Base64)
        .and_then(|raw| {
            Signature::try_from(raw.as_slice()).map_err(|_| Error::InvalidSignature)
        })?;
    let signed_len = header_segment.len() + 1 + claims_segment.len();
    VerifyingKey::<Sha256>::new(jwk.to_rsa_public_key()?)
        .verify(&token.as_bytes()[..signed_len], &signature)
        .map_err(|_| Error::InvalidSignature)?;

    let claims: IdTokenClaims = decode_segment(claims_segment)?;
    check_claims(&claims, options)?;
    Ok(claims)
}

fn check_claims(claims: &IdTokenClaims, options: &VerificationOptions<'_>) -> Result<(), Error> {
    let now = options.now_unix_seconds;
    match claims {
        c if c.iss != options.issuer => Err(Error::InvalidIssuer),
        c if c.aud != options.audience => Err(Error::InvalidAudience),
        c if c.exp <= now => Err(Error::Expired),
        c if c.iat > now + options.leeway_seconds => Err(Error::IssuedInFuture),
        c if c.sub.trim().is_empty() => Err(Error::MissingSubject),
        _ => Ok(()),
    }
}
