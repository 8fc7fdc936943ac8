use super::{CredentialError, Field, SignInOutcome, valid_email};
use crate::identity::{IdentityProvider, ProviderError};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, instrument, warn};

const MIN_PASSWORD_LENGTH: usize = 6;

/// Email and password sign-in, sign-up and reset.
pub struct PasswordSignIn {
    provider: Arc<dyn IdentityProvider>,
}

impl PasswordSignIn {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &SecretString) -> SignInOutcome {
        let email = match valid_email(email) {
            Ok(email) => email,
            Err(err) => return err.into(),
        };
        if password.expose_secret().is_empty() {
            return CredentialError::InvalidInput {
                field: Field::Password,
                message: "Password is required.",
            }
            .into();
        }
        let outcome =
            SignInOutcome::from(self.provider.sign_in_with_password(email, password).await);
        log_outcome("password sign-in", &outcome);
        outcome
    }

    #[instrument(skip(self, password))]
    pub async fn sign_up(&self, email: &str, password: &SecretString) -> SignInOutcome {
        let email = match valid_email(email) {
            Ok(email) => email,
            Err(err) => return err.into(),
        };
        if password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
            return CredentialError::InvalidInput {
                field: Field::Password,
                message: "Password must be at least 6 characters long.",
            }
            .into();
        }
        let outcome =
            SignInOutcome::from(self.provider.create_user_with_password(email, password).await);
        log_outcome("sign-up", &outcome);
        outcome
    }

    /// # Errors
    /// `UnknownEmail` when no account uses the address, otherwise the mapped provider error.
    #[instrument(skip(self))]
    pub async fn send_password_reset(&self, email: &str) -> Result<(), CredentialError> {
        let email = valid_email(email)?;
        match self.provider.send_password_reset_email(email).await {
            Ok(()) => {
                info!("password reset email sent");
                Ok(())
            }
            Err(ProviderError::UserNotFound) => Err(CredentialError::UnknownEmail),
            Err(err) => {
                warn!("password reset failed: {err}");
                Err(err.into())
            }
        }
    }
}

fn log_outcome(flow: &str, outcome: &SignInOutcome) {
    match outcome {
        SignInOutcome::SignedIn(_) => info!("{flow} succeeded"),
        SignInOutcome::StepUpRequired(_) => info!("{flow} requires a second factor"),
        SignInOutcome::Rejected(err) => info!("{flow} rejected: {err}"),
    }
}
