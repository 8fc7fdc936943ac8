//! Completes a sign-in that the provider interrupted with a second-factor requirement.
//!
//! The resolver holds at most one [`MfaChallenge`]. A wrong code puts it back so the
//! user can retry; any other failure drops it and the user has to start the primary
//! sign-in again.

use super::is_six_digit_code;
use crate::identity::{
    IdentityProvider, IdentitySnapshot, MfaAssertion, MfaChallenge, MfaHint, ProviderError,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("a sign-in challenge is already outstanding")]
    AlreadyOutstanding,
    #[error("no sign-in challenge is outstanding")]
    NoOutstandingChallenge,
    #[error("a code for this challenge is already being verified")]
    Busy,
    #[error("invalid verification code")]
    InvalidCode,
    #[error("no supported second factor is enrolled")]
    NoSupportedFactor,
    #[error("sign-in was cancelled")]
    Cancelled,
    #[error("challenge abandoned: {0}")]
    Abandoned(ProviderError),
}

impl ChallengeError {
    /// Whether the same challenge can still be resolved.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidCode | Self::Busy)
    }

    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidCode => "Invalid code. Please try again.",
            Self::Abandoned(ProviderError::ExpiredChallenge) | Self::NoOutstandingChallenge => {
                "Your sign-in attempt expired. Please sign in again."
            }
            Self::Cancelled => "Sign-in was cancelled.",
            _ => "An error occurred during verification.",
        }
    }
}

enum Slot {
    Empty,
    Outstanding(MfaChallenge),
    InFlight { abandoned: bool },
}

pub struct MfaChallengeResolver {
    provider: Arc<dyn IdentityProvider>,
    slot: Mutex<Slot>,
}

impl MfaChallengeResolver {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of a challenge raised by a primary sign-in.
    ///
    /// # Errors
    /// Returns `AlreadyOutstanding` if another challenge is held; the new one is dropped.
    pub fn begin(&self, challenge: MfaChallenge) -> Result<(), ChallengeError> {
        let mut slot = self.lock();
        match *slot {
            Slot::Empty => {
                debug!(hints = challenge.hints.len(), "sign-in challenge received");
                *slot = Slot::Outstanding(challenge);
                Ok(())
            }
            _ => Err(ChallengeError::AlreadyOutstanding),
        }
    }

    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        !matches!(*self.lock(), Slot::Empty)
    }

    /// Factors the user may answer with.
    #[must_use]
    pub fn hints(&self) -> Vec<MfaHint> {
        match &*self.lock() {
            Slot::Outstanding(challenge) => challenge.hints.clone(),
            _ => Vec::new(),
        }
    }

    /// Answer the outstanding challenge with a code for its first hint.
    ///
    /// # Errors
    /// `InvalidCode` leaves the challenge resolvable. `Abandoned` means it was dropped.
    #[instrument(skip(self, code))]
    pub async fn submit(&self, code: &str) -> Result<IdentitySnapshot, ChallengeError> {
        let code = code.trim();
        let challenge = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Empty => return Err(ChallengeError::NoOutstandingChallenge),
                Slot::InFlight { .. } => return Err(ChallengeError::Busy),
                Slot::Outstanding(_) if !is_six_digit_code(code) => {
                    return Err(ChallengeError::InvalidCode);
                }
                Slot::Outstanding(_) => {}
            }
            match std::mem::replace(&mut *slot, Slot::InFlight { abandoned: false }) {
                Slot::Outstanding(challenge) => challenge,
                _ => return Err(ChallengeError::NoOutstandingChallenge),
            }
        };

        let Some(hint) = challenge.hints.first() else {
            *self.lock() = Slot::Empty;
            warn!("sign-in challenge carried no usable factor");
            return Err(ChallengeError::NoSupportedFactor);
        };
        let assertion = MfaAssertion::totp(hint, code);
        let result = self
            .provider
            .resolve_mfa_sign_in(&challenge.handle, assertion)
            .await;

        let abandoned = {
            let mut slot = self.lock();
            let abandoned = matches!(*slot, Slot::InFlight { abandoned: true });
            match &result {
                Err(ProviderError::InvalidVerificationCode) if !abandoned => {
                    *slot = Slot::Outstanding(challenge);
                }
                _ => *slot = Slot::Empty,
            }
            abandoned
        };

        match result {
            Ok(_) if abandoned => {
                // The provider already signed the user in; undo it.
                if let Err(err) = self.provider.sign_out().await {
                    warn!("sign-out after abandoned challenge failed: {err}");
                }
                info!("second factor accepted after abandon, signed out");
                Err(ChallengeError::Cancelled)
            }
            Ok(snapshot) => {
                info!("second factor accepted");
                Ok(snapshot)
            }
            Err(ProviderError::InvalidVerificationCode) if abandoned => {
                Err(ChallengeError::Cancelled)
            }
            Err(ProviderError::InvalidVerificationCode) => Err(ChallengeError::InvalidCode),
            Err(err) => {
                warn!("sign-in challenge abandoned: {err}");
                Err(ChallengeError::Abandoned(err))
            }
        }
    }

    /// Drop the outstanding challenge. Returns `false` if there was none.
    ///
    /// A submit already in flight finishes, but its outcome is a failure: a wrong code no
    /// longer restores the challenge, and an accepted code is followed by a sign-out.
    pub fn abandon(&self) -> bool {
        let mut slot = self.lock();
        match &mut *slot {
            Slot::Empty => false,
            Slot::Outstanding(_) => {
                *slot = Slot::Empty;
                debug!("sign-in challenge abandoned by user");
                true
            }
            Slot::InFlight { abandoned } => {
                *abandoned = true;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::memory::{FailurePoint, MemoryProvider, MemoryProviderConfig};
    use crate::identity::{ResolverHandle, TotpSecret};
    use secrecy::{ExposeSecret, SecretString};
    use std::time::Duration;
    use totp_rs::{Algorithm, Secret, TOTP};

    const TEST_PRIVATE_KEY_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/signing_key.pem"
    ));

    fn password() -> SecretString {
        SecretString::from("secret1".to_string())
    }

    fn code_for(secret: &TotpSecret) -> String {
        let bytes = Secret::Encoded(secret.secret_base32().expose_secret().to_string())
            .to_bytes()
            .expect("decode");
        TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, "user".to_string())
            .expect("totp")
            .generate_current()
            .expect("code")
    }

    fn wrong_code(right: &str) -> String {
        if right == "000000" {
            "111111".to_string()
        } else {
            "000000".to_string()
        }
    }

    /// A provider with one TOTP-enrolled user, signed out.
    async fn enrolled(config: MemoryProviderConfig) -> (Arc<MemoryProvider>, TotpSecret) {
        let provider = Arc::new(MemoryProvider::new(config));
        provider.add_user("a@b.co", "secret1", true).await;
        provider
            .sign_in_with_password("a@b.co", &password())
            .await
            .expect("sign in");
        let secret = provider.generate_totp_secret().await.expect("secret");
        provider
            .enroll_totp(&secret, &code_for(&secret), None)
            .await
            .expect("enroll");
        provider.sign_out().await.expect("sign out");
        (provider, secret)
    }

    fn config() -> MemoryProviderConfig {
        MemoryProviderConfig::new(TEST_PRIVATE_KEY_PEM.as_bytes()).expect("config")
    }

    async fn step_up(provider: &MemoryProvider) -> MfaChallenge {
        match provider.sign_in_with_password("a@b.co", &password()).await {
            Err(ProviderError::MultiFactorRequired(challenge)) => challenge,
            other => panic!("expected step-up, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_code_keeps_challenge_resolvable() {
        let (provider, secret) = enrolled(config()).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        resolver.begin(step_up(&provider).await).expect("begin");
        assert_eq!(resolver.hints().len(), 1);

        let err = resolver
            .submit(&wrong_code(&code_for(&secret)))
            .await
            .expect_err("wrong");
        assert!(matches!(err, ChallengeError::InvalidCode));
        assert!(err.is_retryable());
        assert!(resolver.is_outstanding());

        let snapshot = resolver.submit(&code_for(&secret)).await.expect("resolve");
        assert_eq!(snapshot.enrolled_factors.len(), 1);
        assert!(!resolver.is_outstanding());

        let err = resolver
            .submit(&code_for(&secret))
            .await
            .expect_err("consumed");
        assert!(matches!(err, ChallengeError::NoOutstandingChallenge));
    }

    #[tokio::test]
    async fn malformed_code_is_rejected_locally() {
        let (provider, _) = enrolled(config()).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        resolver.begin(step_up(&provider).await).expect("begin");
        let err = resolver.submit("12 34").await.expect_err("malformed");
        assert!(matches!(err, ChallengeError::InvalidCode));
        assert_eq!(err.user_message(), "Invalid code. Please try again.");
        assert!(resolver.is_outstanding());
    }

    #[tokio::test]
    async fn second_challenge_is_rejected() {
        let (provider, _) = enrolled(config()).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        resolver.begin(step_up(&provider).await).expect("begin");
        let err = resolver
            .begin(step_up(&provider).await)
            .expect_err("second");
        assert!(matches!(err, ChallengeError::AlreadyOutstanding));
    }

    #[tokio::test]
    async fn expired_challenge_is_abandoned() {
        let (provider, secret) = enrolled(config().with_challenge_ttl(Duration::ZERO)).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        resolver.begin(step_up(&provider).await).expect("begin");
        let err = resolver
            .submit(&code_for(&secret))
            .await
            .expect_err("expired");
        assert!(matches!(
            err,
            ChallengeError::Abandoned(ProviderError::ExpiredChallenge)
        ));
        assert!(!resolver.is_outstanding());
    }

    #[tokio::test]
    async fn network_failure_abandons() {
        let (provider, secret) = enrolled(config()).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        resolver.begin(step_up(&provider).await).expect("begin");
        provider
            .fail_next(
                FailurePoint::ResolveMfa,
                ProviderError::Network("offline".to_string()),
            )
            .await;
        let err = resolver
            .submit(&code_for(&secret))
            .await
            .expect_err("network");
        assert!(matches!(err, ChallengeError::Abandoned(_)));
        assert_eq!(err.user_message(), "An error occurred during verification.");
        assert!(!resolver.is_outstanding());
    }

    #[tokio::test]
    async fn abandon_is_local_and_final() {
        let (provider, secret) = enrolled(config()).await;
        let resolver = MfaChallengeResolver::new(provider.clone());
        assert!(!resolver.abandon());
        resolver.begin(step_up(&provider).await).expect("begin");
        assert!(resolver.abandon());
        assert!(!resolver.is_outstanding());
        assert!(provider.current_user().await.is_none());
        let err = resolver
            .submit(&code_for(&secret))
            .await
            .expect_err("abandoned");
        assert!(matches!(err, ChallengeError::NoOutstandingChallenge));
    }

    #[tokio::test]
    async fn abandon_during_submit_leaves_user_signed_out() {
        let (provider, secret) = enrolled(config()).await;
        let resolver = Arc::new(MfaChallengeResolver::new(provider.clone()));
        resolver.begin(step_up(&provider).await).expect("begin");
        provider
            .delay_next(FailurePoint::ResolveMfa, Duration::from_millis(200))
            .await;

        let submitting = {
            let resolver = resolver.clone();
            let code = code_for(&secret);
            tokio::spawn(async move { resolver.submit(&code).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(resolver.abandon());

        let err = submitting
            .await
            .expect("join")
            .expect_err("abandoned attempt must fail");
        assert!(matches!(err, ChallengeError::Cancelled));
        assert!(!resolver.is_outstanding());
        assert!(provider.current_user().await.is_none());
    }

    #[tokio::test]
    async fn challenge_without_hints_is_dropped() {
        let provider = Arc::new(MemoryProvider::new(config()));
        let resolver = MfaChallengeResolver::new(provider);
        resolver
            .begin(MfaChallenge {
                handle: ResolverHandle::new("h"),
                hints: Vec::new(),
            })
            .expect("begin");
        let err = resolver.submit("123456").await.expect_err("no factor");
        assert!(matches!(err, ChallengeError::NoSupportedFactor));
        assert!(!resolver.is_outstanding());
    }
}
