//! Browser-side identity components.
//!
//! The [`observer::AuthStateObserver`] is the only writer of the current identity.
//! Everything else reads the published [`observer::AuthState`] and talks to the
//! identity provider through the [`crate::identity::IdentityProvider`] trait.

pub mod frontends;
pub mod mfa;
pub mod observer;
pub mod pending_email;
pub mod session_sync;
pub mod startup;

use crate::identity::{IdentityProvider, ProviderError};
use tracing::{info, warn};

/// Sign the current user out. The observer picks up the change and revokes the session.
///
/// # Errors
/// Returns the provider error if the sign-out call fails.
pub async fn sign_out(provider: &dyn IdentityProvider) -> Result<(), ProviderError> {
    match provider.sign_out().await {
        Ok(()) => {
            info!("signed out");
            Ok(())
        }
        Err(err) => {
            warn!("sign out failed: {err}");
            Err(err)
        }
    }
}
