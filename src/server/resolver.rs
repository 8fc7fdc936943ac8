//! Turns an inbound request into a verified caller, or no caller at all.
//!
//! The session cookie is checked first, then an `Authorization: Bearer` header.
//! Every failure (missing material, expired or forged token) yields `None` and is
//! logged once; nothing propagates to the handler.

use super::verifier::TokenVerifier;
use crate::token::IdTokenClaims;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use std::sync::Arc;
use tracing::{debug, warn};

/// A request principal whose token passed verification.
#[derive(Debug, Clone)]
pub struct Caller {
    pub uid: String,
    pub claims: IdTokenClaims,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Cookie,
    Bearer,
}

pub struct ServerSessionResolver {
    verifier: Option<Arc<TokenVerifier>>,
    cookie_name: String,
}

impl ServerSessionResolver {
    /// `verifier` is `None` when no verification material was provisioned.
    #[must_use]
    pub fn new(verifier: Option<Arc<TokenVerifier>>, cookie_name: impl Into<String>) -> Self {
        Self {
            verifier,
            cookie_name: cookie_name.into(),
        }
    }

    #[must_use]
    pub fn verifier(&self) -> Option<&TokenVerifier> {
        self.verifier.as_deref()
    }

    pub async fn resolve(&self, headers: &HeaderMap) -> Option<Caller> {
        let Some((token, source)) = self.session_token(headers) else {
            debug!("no session credential on request");
            return None;
        };
        let Some(verifier) = &self.verifier else {
            warn!("session credential present but verification material is not provisioned");
            return None;
        };
        match verifier.verify(&token).await {
            Ok(claims) => {
                debug!(uid = %claims.sub, ?source, "caller resolved");
                Some(Caller {
                    uid: claims.sub.clone(),
                    claims,
                })
            }
            Err(err) => {
                warn!(?source, "session credential rejected: {err}");
                None
            }
        }
    }

    fn session_token(&self, headers: &HeaderMap) -> Option<(String, TokenSource)> {
        if let Some(token) = cookie_value(headers, &self.cookie_name) {
            return Some((token, TokenSource::Cookie));
        }
        bearer_token(headers).map(|token| (token, TokenSource::Bearer))
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Jwks, sign_rs256};
    use axum::http::HeaderValue;
    use chrono::Utc;

    const TEST_PRIVATE_KEY_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/signing_key.pem"
    ));
    const ISSUER: &str = "https://securetoken.symptoscan.local";
    const AUDIENCE: &str = "symptoscan";

    fn resolver() -> ServerSessionResolver {
        let jwks =
            Jwks::from_rsa_private_key_pem_or_der(TEST_PRIVATE_KEY_PEM.as_bytes(), "k1").expect("jwks");
        ServerSessionResolver::new(
            Some(Arc::new(TokenVerifier::new(jwks, ISSUER, AUDIENCE))),
            "__session",
        )
    }

    fn token(exp_offset: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = IdTokenClaims {
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            sub: "user-1".to_string(),
            exp: now + exp_offset,
            iat: now,
            email: None,
            email_verified: false,
            extra: serde_json::Map::new(),
        };
        sign_rs256(TEST_PRIVATE_KEY_PEM.as_bytes(), "k1", &claims).expect("sign")
    }

    fn with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[tokio::test]
    async fn no_cookie_is_no_caller() {
        assert!(resolver().resolve(&HeaderMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn valid_cookie_resolves() {
        let headers = with_cookie(&format!("theme=dark; __session={}", token(600)));
        let caller = resolver().resolve(&headers).await.expect("caller");
        assert_eq!(caller.uid, "user-1");
    }

    #[tokio::test]
    async fn expired_or_tampered_is_no_caller() {
        let headers = with_cookie(&format!("__session={}", token(-600)));
        assert!(resolver().resolve(&headers).await.is_none());

        let mut tampered = token(600);
        tampered.push('x');
        let headers = with_cookie(&format!("__session={tampered}"));
        assert!(resolver().resolve(&headers).await.is_none());

        let headers = with_cookie("__session=not.a.jwt");
        assert!(resolver().resolve(&headers).await.is_none());
    }

    #[tokio::test]
    async fn bearer_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token(600))).expect("header"),
        );
        assert!(resolver().resolve(&headers).await.is_some());
    }

    #[tokio::test]
    async fn unprovisioned_material_degrades() {
        let resolver = ServerSessionResolver::new(None, "__session");
        let headers = with_cookie(&format!("__session={}", token(600)));
        assert!(resolver.resolve(&headers).await.is_none());
    }

    #[test]
    fn cookie_parsing() {
        let headers = with_cookie("a=1; __session=; b=2");
        assert_eq!(cookie_value(&headers, "__session"), None);
        let headers = with_cookie("a=1;__session=tok;b=2");
        assert_eq!(cookie_value(&headers, "__session").as_deref(), Some("tok"));
        assert_eq!(cookie_value(&headers, "session"), None);
    }
}
