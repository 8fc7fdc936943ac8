//! `/health`: build metadata plus the state of the diagnosis store and the token
//! verification material.

use crate::GIT_COMMIT_HASH;
use crate::diagnosis::DiagnosisStore;
use crate::server::resolver::ServerSessionResolver;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::{Instrument, debug, error, info_span, warn};
use utoipa::ToSchema;

const HEALTH_STORE_TIMEOUT_SECONDS: u64 = 2;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    store: String,
    store_kind: String,
    token_keys: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Dependencies are healthy", body = Health),
        (status = 503, description = "A dependency is unhealthy", body = Health)
    ),
    tag = "health",
)]
/// Report build info and dependency status.
///
/// Missing verification material is reported as `unconfigured` and does not make
/// the service unhealthy; anonymous analysis keeps working without it.
pub async fn health(
    method: Method,
    store: Extension<Arc<dyn DiagnosisStore>>,
    resolver: Extension<Arc<ServerSessionResolver>>,
) -> impl IntoResponse {
    let store_healthy = ping_store(store.0.as_ref()).await;
    let (token_keys, keys_healthy) = match resolver.verifier() {
        Some(verifier) => {
            let status = verifier.dependency_status().await;
            (status.as_str(), status.is_healthy())
        }
        None => ("unconfigured", true),
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: if store_healthy { "ok" } else { "error" }.to_string(),
        store_kind: store.kind().to_string(),
        token_keys: token_keys.to_string(),
    };

    let status = if store_healthy && keys_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let headers = app_header(&health);

    if method == Method::GET {
        (status, headers, Json(health)).into_response()
    } else {
        (status, headers, Body::empty()).into_response()
    }
}

/// `X-App: name:version:shorthash`; the hash is left empty for non-git builds.
fn app_header(health: &Health) -> HeaderMap {
    let short = health.commit.get(..7).filter(|_| health.commit.len() > 7);
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&format!(
        "{}:{}:{}",
        health.name,
        health.version,
        short.unwrap_or_default()
    )) {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => debug!("X-App header not sent: {err}"),
    }
    headers
}

async fn ping_store(store: &dyn DiagnosisStore) -> bool {
    let span = info_span!("store.ping", store.kind = store.kind());
    match timeout(
        Duration::from_secs(HEALTH_STORE_TIMEOUT_SECONDS),
        store.ping().instrument(span),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!("Failed to ping diagnosis store: {}", err);
            false
        }
        Err(_) => {
            warn!("Diagnosis store health check timed out");
            false
        }
    }
}
