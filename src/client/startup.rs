//! One-time checks when the application starts.
//!
//! Before any auth-dependent view renders, the application resolves a pending federated
//! redirect and a sign-in link it may have been opened with. Both run once per process;
//! later calls return the first report. [`AuthBootstrap::ready`] turns true only once
//! those checks finished and the observer has delivered its first state.

use crate::client::frontends::SignInOutcome;
use crate::client::frontends::email_link::{EmailLinkSignIn, LinkCompletion};
use crate::client::frontends::federated::FederatedSignIn;
use crate::client::mfa::MfaChallengeResolver;
use crate::client::observer::{AuthState, AuthStateObserver};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// What a startup check produced, reduced to what the first render needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupEvent {
    SignedIn { uid: String },
    /// The challenge was handed to the MFA resolver.
    StepUpRequired,
    /// Opened with a sign-in link but no address is stored on this device.
    NeedsEmail,
    Failed { message: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub redirect: Option<StartupEvent>,
    pub email_link: Option<StartupEvent>,
}

pub struct AuthBootstrap {
    observer: Arc<AuthStateObserver>,
    federated: FederatedSignIn,
    email_link: EmailLinkSignIn,
    challenges: Arc<MfaChallengeResolver>,
    report: OnceCell<StartupReport>,
}

impl AuthBootstrap {
    #[must_use]
    pub fn new(
        observer: Arc<AuthStateObserver>,
        federated: FederatedSignIn,
        email_link: EmailLinkSignIn,
        challenges: Arc<MfaChallengeResolver>,
    ) -> Self {
        Self {
            observer,
            federated,
            email_link,
            challenges,
            report: OnceCell::new(),
        }
    }

    /// Run the startup checks for the URL the application was opened with.
    pub async fn run(&self, current_url: &str) -> &StartupReport {
        self.report
            .get_or_init(|| async {
                let redirect = self
                    .federated
                    .resolve_pending()
                    .await
                    .map(|outcome| self.route(outcome));
                let email_link = match self.email_link.complete(current_url).await {
                    LinkCompletion::NotASignInLink => None,
                    LinkCompletion::NeedsEmail => Some(StartupEvent::NeedsEmail),
                    LinkCompletion::Finished(outcome) => Some(self.route(outcome)),
                };
                // The first published state must already include both checks.
                self.observer.start().await;
                info!(?redirect, ?email_link, "startup checks finished");
                StartupReport {
                    redirect,
                    email_link,
                }
            })
            .await
    }

    fn route(&self, outcome: SignInOutcome) -> StartupEvent {
        match outcome {
            SignInOutcome::SignedIn(snapshot) => StartupEvent::SignedIn { uid: snapshot.uid },
            SignInOutcome::StepUpRequired(challenge) => {
                if let Err(err) = self.challenges.begin(challenge) {
                    warn!("startup challenge dropped: {err}");
                }
                StartupEvent::StepUpRequired
            }
            SignInOutcome::Rejected(err) => StartupEvent::Failed {
                message: err.user_message(),
            },
        }
    }

    /// Whether auth-dependent UI may render.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.report.initialized() && !self.observer.state().is_loading
    }

    /// Run the checks and wait for the first observer state.
    pub async fn wait_ready(&self, current_url: &str) -> AuthState {
        self.run(current_url).await;
        self.observer.wait_until_loaded().await
    }
}
