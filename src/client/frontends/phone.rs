//! Phone number sign-in with a one-time code.
//!
//! Sending a code consumes a proof-of-humanity token. The token is taken out of the
//! front-end before the provider is called, so a failed send can never reuse it; a
//! fresh one is solved straight away for the retry.

use super::{CredentialError, SignInOutcome, valid_code, valid_phone};
use crate::identity::{HumanityProof, IdentityProvider, PhoneVerificationId, ProviderError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneStep {
    EnterNumber,
    EnterCode,
}

enum Stage {
    Idle,
    CodeSent {
        phone_number: String,
        verification: PhoneVerificationId,
    },
}

struct Inner {
    proof: Option<HumanityProof>,
    stage: Stage,
}

pub struct PhoneSignIn {
    provider: Arc<dyn IdentityProvider>,
    inner: Mutex<Inner>,
}

impl PhoneSignIn {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            inner: Mutex::new(Inner {
                proof: None,
                stage: Stage::Idle,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn step(&self) -> PhoneStep {
        match self.lock().stage {
            Stage::Idle => PhoneStep::EnterNumber,
            Stage::CodeSent { .. } => PhoneStep::EnterCode,
        }
    }

    /// Number the last code was sent to.
    #[must_use]
    pub fn phone_number(&self) -> Option<String> {
        match &self.lock().stage {
            Stage::CodeSent { phone_number, .. } => Some(phone_number.clone()),
            Stage::Idle => None,
        }
    }

    /// Solve a proof-of-humanity challenge ahead of the send step.
    ///
    /// # Errors
    /// Returns the mapped provider error if the challenge cannot be solved.
    pub async fn prepare(&self) -> Result<(), CredentialError> {
        let proof = self.provider.solve_humanity_challenge().await?;
        self.lock().proof = Some(proof);
        Ok(())
    }

    async fn take_proof(&self) -> Result<HumanityProof, CredentialError> {
        let cached = self.lock().proof.take();
        match cached {
            Some(proof) => Ok(proof),
            None => Ok(self.provider.solve_humanity_challenge().await?),
        }
    }

    /// Send a one-time code to `phone_number`.
    ///
    /// # Errors
    /// Validation errors, or `CodeNotSent`/`HumanityCheckFailed` when the provider refused.
    #[instrument(skip(self))]
    pub async fn send_code(&self, phone_number: &str) -> Result<(), CredentialError> {
        let phone_number = valid_phone(phone_number)?;
        let proof = self.take_proof().await?;

        match self.provider.send_phone_code(phone_number, proof).await {
            Ok(verification) => {
                self.lock().stage = Stage::CodeSent {
                    phone_number: phone_number.to_string(),
                    verification,
                };
                info!("verification code sent");
                Ok(())
            }
            Err(err) => {
                warn!("could not send verification code: {err}");
                self.reset_proof().await;
                Err(match err {
                    ProviderError::CaptchaCheckFailed => CredentialError::HumanityCheckFailed,
                    ProviderError::TooManyRequests => CredentialError::TooManyRequests,
                    other => CredentialError::CodeNotSent(other.to_string()),
                })
            }
        }
    }

    async fn reset_proof(&self) {
        match self.provider.solve_humanity_challenge().await {
            Ok(proof) => self.lock().proof = Some(proof),
            Err(err) => debug!("humanity challenge reset deferred: {err}"),
        }
    }

    /// Confirm the code the user received.
    #[instrument(skip(self, code))]
    pub async fn confirm_code(&self, code: &str) -> SignInOutcome {
        let code = match valid_code(code) {
            Ok(code) => code,
            Err(err) => return err.into(),
        };
        let verification = match &self.lock().stage {
            Stage::CodeSent { verification, .. } => verification.clone(),
            Stage::Idle => return CredentialError::CodeExpired.into(),
        };

        let result = self.provider.confirm_phone_code(&verification, code).await;
        let outcome = SignInOutcome::from(result);
        match &outcome {
            SignInOutcome::Rejected(CredentialError::InvalidCode) => {
                debug!("wrong verification code");
            }
            SignInOutcome::Rejected(err) => {
                warn!("phone sign-in failed: {err}");
                self.restart();
            }
            SignInOutcome::SignedIn(_) | SignInOutcome::StepUpRequired(_) => {
                info!("phone code accepted");
                self.restart();
            }
        }
        outcome
    }

    /// Go back to entering a number.
    pub fn restart(&self) {
        self.lock().stage = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::memory::{FailurePoint, MemoryProvider, MemoryProviderConfig, MessageKind};

    const TEST_PRIVATE_KEY_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/signing_key.pem"
    ));
    const PHONE: &str = "+14155552671";

    fn setup() -> (Arc<MemoryProvider>, PhoneSignIn) {
        let provider = Arc::new(MemoryProvider::new(
            MemoryProviderConfig::new(TEST_PRIVATE_KEY_PEM.as_bytes()).expect("config"),
        ));
        let frontend = PhoneSignIn::new(provider.clone());
        (provider, frontend)
    }

    fn other_code(code: &str) -> String {
        if code == "000000" {
            "111111".to_string()
        } else {
            "000000".to_string()
        }
    }

    #[tokio::test]
    async fn send_then_confirm() {
        let (provider, frontend) = setup();
        frontend.prepare().await.expect("prepare");
        frontend.send_code(PHONE).await.expect("send");
        assert_eq!(frontend.step(), PhoneStep::EnterCode);
        assert_eq!(frontend.phone_number().as_deref(), Some(PHONE));

        let code = provider
            .last_message(MessageKind::PhoneCode, PHONE)
            .await
            .expect("code");
        let outcome = frontend.confirm_code(&other_code(&code)).await;
        let SignInOutcome::Rejected(err) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(
            err.user_message(),
            "The code you entered is incorrect. Please try again."
        );
        assert_eq!(frontend.step(), PhoneStep::EnterCode);

        let SignInOutcome::SignedIn(snapshot) = frontend.confirm_code(&code).await else {
            panic!("expected sign-in");
        };
        assert_eq!(snapshot.phone_number.as_deref(), Some(PHONE));
        assert_eq!(frontend.step(), PhoneStep::EnterNumber);
    }

    #[tokio::test]
    async fn failed_send_resets_the_proof() {
        let (provider, frontend) = setup();
        frontend.prepare().await.expect("prepare");
        provider
            .fail_next(
                FailurePoint::SendPhoneCode,
                ProviderError::Network("sms gateway down".to_string()),
            )
            .await;
        let err = frontend.send_code(PHONE).await.expect_err("send fails");
        assert_eq!(
            err.user_message(),
            "Failed to send verification code. Please try again."
        );
        assert_eq!(frontend.step(), PhoneStep::EnterNumber);

        // The spent proof was replaced; the memory provider rejects reused proofs.
        frontend.send_code(PHONE).await.expect("retry");
        assert_eq!(frontend.step(), PhoneStep::EnterCode);
    }

    #[tokio::test]
    async fn invalid_number_never_reaches_provider() {
        let (provider, frontend) = setup();
        let err = frontend.send_code("555-1234").await.expect_err("invalid");
        assert!(matches!(err, CredentialError::InvalidInput { .. }));
        assert!(provider.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn confirm_without_code_sent() {
        let (_, frontend) = setup();
        let outcome = frontend.confirm_code("123456").await;
        assert!(matches!(
            outcome,
            SignInOutcome::Rejected(CredentialError::CodeExpired)
        ));
    }
}
