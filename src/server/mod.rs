//! HTTP surface: session endpoint, analysis action, history and health.

pub mod handlers;
pub mod openapi;
pub mod resolver;
pub mod verifier;

pub use self::handlers::SessionConfig;
pub use self::resolver::{Caller, ServerSessionResolver};
pub use self::verifier::TokenVerifier;

use crate::analysis::SymptomAnalyzer;
use crate::diagnosis::DiagnosisStore;
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::{get, post},
};
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_swagger_ui::SwaggerUi;

/// Everything the handlers need, injected as request extensions.
#[derive(Clone)]
pub struct Services {
    pub session: SessionConfig,
    pub resolver: Arc<ServerSessionResolver>,
    pub store: Arc<dyn DiagnosisStore>,
    pub analyzer: Arc<dyn SymptomAnalyzer>,
}

#[must_use]
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(handlers::health).options(handlers::health))
        .route(
            "/api/auth/session",
            post(handlers::session::establish).delete(handlers::session::revoke),
        )
        .route("/api/analysis", post(handlers::analyze))
        .route("/api/history", get(handlers::history))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(services.session))
                .layer(Extension(services.resolver))
                .layer(Extension(services.store))
                .layer(Extension(services.analyzer)),
        )
}

/// Bind `[::]:port` and serve until ctrl-c.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn new(port: u16, services: Services) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    serve(listener, services, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", err);
        }
        info!("Gracefully shutdown");
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, services: Services, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(services).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = route,
        request_id
    )
}
