//! Keeps the server-side session cookie in step with the client identity.
//!
//! ## Flow Overview
//!
//! The observer enqueues `establish` and `revoke` commands on a [`SessionSyncHandle`].
//! A single worker task drains the queue one command at a time, so a `revoke` queued
//! after an `establish` is never applied before it, however slow the first call is.
//!
//! `establish` fetches a fresh ID token from the provider and posts it to the session
//! endpoint. `revoke` asks the endpoint to delete the cookie.
//!
//! ## Failure policy
//!
//! Sync is best effort. Failures are logged and dropped; nothing is returned to the
//! caller and the queue keeps going. The next observer event corrects any divergence.

use crate::identity::{IdentityProvider, IdentitySnapshot, ProviderError};
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

const ENDPOINT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not obtain ID token: {0}")]
    Token(#[from] ProviderError),
    #[error("session endpoint unreachable: {0}")]
    Transport(String),
    #[error("session endpoint rejected the request with status {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Server side of the session: sets and clears the HTTP-only cookie.
#[async_trait]
pub trait SessionEndpoint: Send + Sync {
    async fn establish(&self, id_token: &SecretString) -> Result<(), SyncError>;
    async fn revoke(&self) -> Result<(), SyncError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EstablishRequest<'a> {
    id_token: &'a str,
}

/// Talks to the session endpoint over HTTP.
///
/// The cookie the endpoint sets lands in a jar shared with [`Self::client`], so backend
/// calls made through that client carry the session.
#[derive(Clone)]
pub struct HttpSessionEndpoint {
    client: Client,
    jar: Arc<Jar>,
    url: Url,
}

impl HttpSessionEndpoint {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url) -> Result<Self, SyncError> {
        Self::with_jar(url, Arc::new(Jar::default()))
    }

    /// Use an existing cookie jar, e.g. one shared with other clients.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_jar(url: Url, jar: Arc<Jar>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(ENDPOINT_TIMEOUT_SECONDS))
            .cookie_provider(jar.clone())
            .build()?;
        Ok(Self { client, jar, url })
    }

    /// Client for backend actions; it sends whatever session cookie is current.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `Cookie` header value the jar holds for the endpoint's origin, if any.
    #[must_use]
    pub fn cookies(&self) -> Option<String> {
        self.jar
            .cookies(&self.url)
            .and_then(|value| value.to_str().ok().map(ToString::to_string))
    }
}

#[async_trait]
impl SessionEndpoint for HttpSessionEndpoint {
    async fn establish(&self, id_token: &SecretString) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&EstablishRequest {
                id_token: id_token.expose_secret(),
            })
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(SyncError::Rejected {
                status: status.as_u16(),
            }),
        }
    }

    async fn revoke(&self) -> Result<(), SyncError> {
        let response = self.client.delete(self.url.clone()).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(SyncError::Rejected {
                status: status.as_u16(),
            }),
        }
    }
}

/// What a [`MemorySessionEndpoint`] saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointCall {
    Establish,
    Revoke,
}

#[derive(Default)]
struct CookieJar {
    cookie: Option<SecretString>,
    calls: Vec<EndpointCall>,
    unreachable: bool,
    establish_delay: Option<Duration>,
}

/// Session endpoint that keeps the "cookie" in memory.
#[derive(Clone, Default)]
pub struct MemorySessionEndpoint {
    jar: Arc<Mutex<CookieJar>>,
}

impl MemorySessionEndpoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn jar(&self) -> std::sync::MutexGuard<'_, CookieJar> {
        self.jar
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn cookie(&self) -> Option<SecretString> {
        self.jar().cookie.clone()
    }

    #[must_use]
    pub fn has_cookie(&self) -> bool {
        self.jar().cookie.is_some()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<EndpointCall> {
        self.jar().calls.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.jar().unreachable = unreachable;
    }

    /// Slow down every `establish` call.
    pub fn set_establish_delay(&self, delay: Option<Duration>) {
        self.jar().establish_delay = delay;
    }
}

#[async_trait]
impl SessionEndpoint for MemorySessionEndpoint {
    async fn establish(&self, id_token: &SecretString) -> Result<(), SyncError> {
        let delay = self.jar().establish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut jar = self.jar();
        if jar.unreachable {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        jar.calls.push(EndpointCall::Establish);
        jar.cookie = Some(id_token.clone());
        Ok(())
    }

    async fn revoke(&self) -> Result<(), SyncError> {
        let mut jar = self.jar();
        if jar.unreachable {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        jar.calls.push(EndpointCall::Revoke);
        jar.cookie = None;
        Ok(())
    }
}

enum Command {
    Establish { uid: String },
    Revoke,
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable sender side of the sync queue.
#[derive(Clone)]
pub struct SessionSyncHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionSyncHandle {
    /// Queue an establish for `snapshot`. Returns immediately.
    pub fn establish(&self, snapshot: &IdentitySnapshot) {
        if self
            .tx
            .send(Command::Establish {
                uid: snapshot.uid.clone(),
            })
            .is_err()
        {
            warn!("session sync worker is gone, establish dropped");
        }
    }

    /// Queue a revoke. Returns immediately.
    pub fn revoke(&self) {
        if self.tx.send(Command::Revoke).is_err() {
            warn!("session sync worker is gone, revoke dropped");
        }
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub struct SessionSync;

impl SessionSync {
    /// Start the worker. It stops once every handle has been dropped.
    #[must_use]
    pub fn spawn(
        provider: Arc<dyn IdentityProvider>,
        endpoint: Arc<dyn SessionEndpoint>,
    ) -> SessionSyncHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(provider, endpoint, rx));
        SessionSyncHandle { tx }
    }
}

async fn run(
    provider: Arc<dyn IdentityProvider>,
    endpoint: Arc<dyn SessionEndpoint>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Establish { uid } => {
                let span = info_span!("session_sync.establish", uid = %uid);
                match establish(provider.as_ref(), endpoint.as_ref())
                    .instrument(span)
                    .await
                {
                    Ok(()) => debug!("session established"),
                    Err(err) => warn!("session establish failed: {err}"),
                }
            }
            Command::Revoke => {
                let span = info_span!("session_sync.revoke");
                match endpoint.revoke().instrument(span).await {
                    Ok(()) => debug!("session revoked"),
                    Err(err) => warn!("session revoke failed: {err}"),
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("session sync worker stopped");
}

async fn establish(
    provider: &dyn IdentityProvider,
    endpoint: &dyn SessionEndpoint,
) -> Result<(), SyncError> {
    let id_token = provider.id_token(false).await?;
    endpoint.establish(&id_token).await
}
