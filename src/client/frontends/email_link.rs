//! Passwordless sign-in through a link sent by email.

use super::{CredentialError, SignInOutcome, valid_email};
use crate::client::pending_email::PendingEmailStore;
use crate::identity::IdentityProvider;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// What happened when the application was opened with a URL.
#[derive(Debug)]
pub enum LinkCompletion {
    NotASignInLink,
    /// No address was persisted on this device; ask the user and call
    /// [`EmailLinkSignIn::complete_with_email`].
    NeedsEmail,
    Finished(SignInOutcome),
}

pub struct EmailLinkSignIn {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn PendingEmailStore>,
    continue_url: Url,
}

impl EmailLinkSignIn {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn PendingEmailStore>,
        continue_url: Url,
    ) -> Self {
        Self {
            provider,
            store,
            continue_url,
        }
    }

    /// Email a sign-in link and remember the address on this device.
    ///
    /// # Errors
    /// Validation or provider errors. A failure to persist the address is only logged;
    /// the link still works after re-entering the email.
    #[instrument(skip(self))]
    pub async fn send_link(&self, email: &str) -> Result<(), CredentialError> {
        let email = valid_email(email)?;
        self.provider
            .send_email_link(email, &self.continue_url)
            .await?;
        if let Err(err) = self.store.save(email) {
            warn!("could not persist pending sign-in email: {err}");
        }
        info!("sign-in link sent");
        Ok(())
    }

    #[must_use]
    pub fn is_sign_in_link(&self, link: &str) -> bool {
        self.provider.is_email_sign_in_link(link)
    }

    /// Finish sign-in for the link the application was opened with.
    #[instrument(skip_all)]
    pub async fn complete(&self, link: &str) -> LinkCompletion {
        if !self.is_sign_in_link(link) {
            return LinkCompletion::NotASignInLink;
        }
        let pending = match self.store.load() {
            Ok(pending) => pending,
            Err(err) => {
                warn!("could not read pending sign-in email: {err}");
                None
            }
        };
        match pending {
            Some(email) => LinkCompletion::Finished(self.complete_with_email(link, &email).await),
            None => {
                debug!("no pending sign-in email on this device");
                LinkCompletion::NeedsEmail
            }
        }
    }

    /// Finish sign-in with an address the user typed in.
    #[instrument(skip_all)]
    pub async fn complete_with_email(&self, link: &str, email: &str) -> SignInOutcome {
        let email = match valid_email(email) {
            Ok(email) => email,
            Err(err) => return err.into(),
        };
        let result = self.provider.sign_in_with_email_link(email, link).await;
        let outcome = SignInOutcome::from(result);
        match &outcome {
            SignInOutcome::SignedIn(_) | SignInOutcome::StepUpRequired(_) => {
                if let Err(err) = self.store.clear() {
                    warn!("could not clear pending sign-in email: {err}");
                }
                info!("sign-in link consumed");
            }
            SignInOutcome::Rejected(err) => warn!("email link sign-in failed: {err}"),
        }
        outcome
    }
}
