//! Sign-in through a federated identity provider by full-page redirect.

use super::{CredentialError, SignInOutcome};
use crate::identity::{FederatedProvider, IdentityProvider, ProviderError};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use url::Url;

pub struct FederatedSignIn {
    provider: Arc<dyn IdentityProvider>,
    federated: FederatedProvider,
}

impl FederatedSignIn {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, federated: FederatedProvider) -> Self {
        Self {
            provider,
            federated,
        }
    }

    /// URL to navigate to. The application leaves and comes back through startup.
    ///
    /// # Errors
    /// Returns `FederatedSignInFailed` if the redirect cannot be prepared.
    #[instrument(skip(self), fields(provider = self.federated.provider_id()))]
    pub async fn begin(&self) -> Result<Url, CredentialError> {
        self.provider
            .sign_in_with_redirect(self.federated)
            .await
            .map_err(|err| {
                warn!("could not start federated sign-in: {err}");
                CredentialError::FederatedSignInFailed(err.to_string())
            })
    }

    /// Resolve a redirect that brought the user back, if there is one.
    #[instrument(skip(self), fields(provider = self.federated.provider_id()))]
    pub async fn resolve_pending(&self) -> Option<SignInOutcome> {
        match self.provider.get_redirect_result().await {
            Ok(None) => None,
            Ok(Some(snapshot)) => {
                info!("federated sign-in completed");
                Some(SignInOutcome::SignedIn(snapshot))
            }
            Err(ProviderError::MultiFactorRequired(challenge)) => {
                Some(SignInOutcome::StepUpRequired(challenge))
            }
            Err(ProviderError::AccountExistsWithDifferentCredential) => Some(
                CredentialError::AccountExistsWithDifferentCredential.into(),
            ),
            Err(err) => {
                warn!("federated sign-in failed: {err}");
                Some(CredentialError::FederatedSignInFailed(err.to_string()).into())
            }
        }
    }
}
