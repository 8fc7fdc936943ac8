//! Process-wide view of "who is signed in right now".
//!
//! ## Flow Overview
//!
//! [`AuthStateObserver::start`] subscribes to the identity provider exactly once and
//! spawns a task that turns provider events into [`AuthState`] values published on a
//! `watch` channel. Later calls to `start` hand out another receiver for the same
//! stream.
//!
//! Each event replaces the snapshot wholesale. A delivery error clears the snapshot
//! (fail closed) and records `last_error`; the next successful event clears it again.
//!
//! ## Session sync triggers
//!
//! - non-null identity: `establish` (also on token refresh or user switch)
//! - non-null to null: `revoke`
//! - first event is null: `revoke`, clearing a cookie left over from a previous process
//!
//! Triggers are queued before the new state is published and never awaited.

use crate::client::session_sync::SessionSyncHandle;
use crate::identity::{AuthStateEvent, IdentityProvider, IdentitySnapshot};
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Published state. Cheap to clone; the snapshot is shared.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub snapshot: Option<Arc<IdentitySnapshot>>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            snapshot: None,
            is_loading: true,
            last_error: None,
        }
    }
}

impl AuthState {
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.snapshot.is_some()
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.snapshot.as_deref().map(|s| s.uid.as_str())
    }
}

pub struct AuthStateObserver {
    provider: Arc<dyn IdentityProvider>,
    sync: Option<SessionSyncHandle>,
    state: watch::Sender<AuthState>,
    task: OnceCell<JoinHandle<()>>,
}

impl AuthStateObserver {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, sync: Option<SessionSyncHandle>) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            provider,
            sync,
            state,
            task: OnceCell::new(),
        }
    }

    /// Subscribe to the provider (first call only) and return a receiver of the state.
    pub async fn start(&self) -> watch::Receiver<AuthState> {
        self.task
            .get_or_init(|| async {
                let events = self.provider.subscribe().await;
                debug!("auth state subscription started");
                tokio::spawn(pump(events, self.state.clone(), self.sync.clone()))
            })
            .await;
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.task.initialized()
    }

    /// Current state without waiting.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<IdentitySnapshot>> {
        self.state.borrow().snapshot.clone()
    }

    /// A receiver for components that only read the state (no subscription side effects).
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Wait for the first provider event.
    pub async fn wait_until_loaded(&self) -> AuthState {
        let mut rx = self.start().await;
        match rx.wait_for(|s| !s.is_loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Stop listening to the provider.
    pub fn dispose(&self) {
        if let Some(task) = self.task.get() {
            task.abort();
            debug!("auth state subscription disposed");
        }
    }
}

impl Drop for AuthStateObserver {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<AuthStateEvent>,
    state: watch::Sender<AuthState>,
    sync: Option<SessionSyncHandle>,
) {
    let mut first = true;
    while let Some(event) = events.recv().await {
        let had_identity = state.borrow().snapshot.is_some();
        let next = match event {
            AuthStateEvent::Changed(snapshot) => {
                let snapshot = snapshot.map(Arc::new);
                if let Some(sync) = &sync {
                    match &snapshot {
                        Some(s) => sync.establish(s),
                        None if had_identity || first => sync.revoke(),
                        None => {}
                    }
                }
                AuthState {
                    snapshot,
                    is_loading: false,
                    last_error: None,
                }
            }
            AuthStateEvent::Error(err) => {
                warn!("auth state delivery error: {err}");
                if let Some(sync) = &sync {
                    if had_identity || first {
                        sync.revoke();
                    }
                }
                AuthState {
                    snapshot: None,
                    is_loading: false,
                    last_error: Some(err.to_string()),
                }
            }
        };
        first = false;
        state.send_replace(next);
    }
    debug!("auth state stream closed");
}
