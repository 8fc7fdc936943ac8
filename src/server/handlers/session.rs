//! Session endpoint: mirrors the client's bearer token into an HTTP-only cookie.
//!
//! The token is not verified here. Verification happens on every backend action
//! through the session resolver, so a bogus cookie only yields an anonymous caller.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

pub const DEFAULT_COOKIE_NAME: &str = "__session";
/// Five days.
pub const DEFAULT_TTL_SECONDS: u64 = 60 * 60 * 24 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    cookie_name: String,
    ttl_seconds: u64,
    secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            secure: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Drop the `Secure` attribute, for plain-http local development.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    fn cookie(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
            self.cookie_name
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    #[must_use]
    pub fn set_cookie(&self, token: &str) -> String {
        self.cookie(token, self.ttl_seconds)
    }

    #[must_use]
    pub fn clear_cookie(&self) -> String {
        self.cookie("", 0)
    }
}

#[derive(ToSchema, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    status: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    pub(crate) fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

fn success() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "success".to_string(),
    })
}

fn bad_request(message: &str) -> (StatusCode, HeaderMap, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        HeaderMap::new(),
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

#[utoipa::path(
    post,
    path= "/api/auth/session",
    request_body = SessionRequest,
    responses (
        (status = 200, description = "Session cookie set", body = StatusResponse),
        (status = 400, description = "No ID token in the request", body = ErrorResponse)
    ),
    tag = "session",
)]
/// Set the session cookie from `{"idToken": "..."}`.
pub async fn establish(config: Extension<SessionConfig>, body: Bytes) -> impl IntoResponse {
    let request: SessionRequest = serde_json::from_slice(&body).unwrap_or_else(|err| {
        debug!("Unparseable session request body: {}", err);
        SessionRequest::default()
    });

    let Some(token) = request.id_token.filter(|token| !token.is_empty()) else {
        return bad_request("ID token is required").into_response();
    };

    let Ok(cookie) = HeaderValue::from_str(&config.set_cookie(&token)) else {
        warn!("ID token contains characters not allowed in a cookie");
        return bad_request("ID token is invalid").into_response();
    };

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    info!(cookie = config.cookie_name(), "session cookie set");

    (StatusCode::OK, headers, success()).into_response()
}

#[utoipa::path(
    delete,
    path= "/api/auth/session",
    responses (
        (status = 200, description = "Session cookie cleared", body = StatusResponse)
    ),
    tag = "session",
)]
/// Clear the session cookie. Always succeeds.
pub async fn revoke(config: Extension<SessionConfig>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&config.clear_cookie()) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => warn!("Failed to build clearing cookie: {}", err),
    }
    info!(cookie = config.cookie_name(), "session cookie cleared");

    (StatusCode::OK, headers, success())
}
