//! TOTP enrollment for an already signed-in user.
//!
//! ## States
//!
//! ```text
//! NotEnrolled --start--> SecretGenerated --verify(bad code)--> PendingVerification
//!      ^                      |   \                                  |
//!      |                      |    `--verify(ok)--> Enrolled <-------'
//!      `------cancel----------'                        |
//!      `-------------------disenroll(last factor)------'
//! ```
//!
//! The pending secret lives only in this manager's memory. It is never logged, never
//! persisted, and is dropped on success, cancel, or when the signed-in user changes.
//!
//! The email verification gate is evaluated against the latest identity snapshot at
//! the moment `start_enrollment` is called, so verifying in another tab takes effect
//! without a reload.

use super::is_six_digit_code;
use crate::client::observer::AuthState;
use crate::identity::{
    EnrolledFactor, FactorKind, IdentityProvider, IdentitySnapshot, ProviderError, TotpSecret,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentPhase {
    NotEnrolled,
    SecretGenerated,
    PendingVerification,
    Enrolled,
}

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("no user is signed in")]
    NotSignedIn,
    #[error("email verification required before enabling two-factor authentication")]
    EmailNotVerified,
    #[error("an enrollment is already pending; cancel it first")]
    AlreadyPending,
    #[error("operation not valid in the {0:?} state")]
    InvalidState(EnrollmentPhase),
    #[error("invalid verification code")]
    InvalidCode,
    #[error("the enrollment secret expired; start again")]
    SecretExpired,
    #[error("factor is not enrolled")]
    FactorNotEnrolled,
    #[error("another enrollment operation is in progress")]
    OperationInProgress,
    #[error("identity provider error: {0}")]
    Provider(ProviderError),
}

impl EnrollmentError {
    /// Whether the user can try again without restarting enrollment.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidCode | Self::OperationInProgress)
    }

    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotSignedIn => "Please sign in to manage two-factor authentication.",
            Self::EmailNotVerified => {
                "Please verify your email address before enabling two-factor authentication."
            }
            Self::InvalidCode => "Invalid code. Please try again.",
            Self::SecretExpired => "The setup code expired. Please start again.",
            Self::FactorNotEnrolled => "That authenticator is not enrolled.",
            Self::AlreadyPending | Self::OperationInProgress => {
                "Another two-factor operation is in progress."
            }
            Self::InvalidState(_) => "That action is not available right now.",
            Self::Provider(_) => "Verification failed. Please try again.",
        }
    }
}

struct Inner {
    uid: Option<String>,
    phase: EnrollmentPhase,
    pending: Option<Arc<TotpSecret>>,
    factors: Vec<EnrolledFactor>,
    as_of: DateTime<Utc>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            uid: None,
            phase: EnrollmentPhase::NotEnrolled,
            pending: None,
            factors: Vec::new(),
            as_of: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn settled_phase(&self) -> EnrollmentPhase {
        if self.factors.is_empty() {
            EnrollmentPhase::NotEnrolled
        } else {
            EnrollmentPhase::Enrolled
        }
    }

    /// Fold the latest snapshot in. Snapshots older than a local success are ignored.
    fn reconcile(&mut self, snapshot: Option<&IdentitySnapshot>) {
        let Some(snapshot) = snapshot else {
            if self.pending.is_some() {
                debug!("signed out, pending enrollment discarded");
            }
            *self = Self::empty();
            return;
        };

        if self.uid.as_deref() != Some(snapshot.uid.as_str()) {
            if self.pending.is_some() {
                debug!("user changed, pending enrollment discarded");
            }
            self.uid = Some(snapshot.uid.clone());
            self.pending = None;
            self.factors = totp_factors(snapshot);
            self.as_of = snapshot.observed_at;
            self.phase = self.settled_phase();
            return;
        }

        if snapshot.observed_at > self.as_of {
            self.factors = totp_factors(snapshot);
            self.as_of = snapshot.observed_at;
            if self.pending.is_none() {
                self.phase = self.settled_phase();
            }
        }
    }
}

fn totp_factors(snapshot: &IdentitySnapshot) -> Vec<EnrolledFactor> {
    snapshot
        .enrolled_factors
        .iter()
        .filter(|f| f.kind == FactorKind::Totp)
        .cloned()
        .collect()
}

/// Clears the in-flight flag when an operation finishes, however it finishes.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EnrollmentError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| EnrollmentError::OperationInProgress)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct EnrollmentManager {
    provider: Arc<dyn IdentityProvider>,
    auth: watch::Receiver<AuthState>,
    inner: Mutex<Inner>,
    in_flight: AtomicBool,
}

impl EnrollmentManager {
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, auth: watch::Receiver<AuthState>) -> Self {
        Self {
            provider,
            auth,
            inner: Mutex::new(Inner::empty()),
            in_flight: AtomicBool::new(false),
        }
    }

    fn latest(&self) -> Option<Arc<IdentitySnapshot>> {
        self.auth.borrow().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile with the latest snapshot and return the guard.
    fn synced(&self) -> (MutexGuard<'_, Inner>, Option<Arc<IdentitySnapshot>>) {
        let latest = self.latest();
        let mut inner = self.lock();
        inner.reconcile(latest.as_deref());
        (inner, latest)
    }

    #[must_use]
    pub fn phase(&self) -> EnrollmentPhase {
        self.synced().0.phase
    }

    #[must_use]
    pub fn enrolled_factors(&self) -> Vec<EnrolledFactor> {
        self.synced().0.factors.clone()
    }

    /// The secret awaiting verification, for rendering the provisioning code.
    #[must_use]
    pub fn pending_secret(&self) -> Option<Arc<TotpSecret>> {
        self.synced().0.pending.clone()
    }

    /// Request a new TOTP secret from the provider.
    ///
    /// # Errors
    /// Fails without changing state if nobody is signed in, the email is not verified,
    /// a secret is already pending, a factor is already enrolled, or the provider call
    /// fails.
    #[instrument(skip(self))]
    pub async fn start_enrollment(&self) -> Result<Arc<TotpSecret>, EnrollmentError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let uid = {
            let (inner, latest) = self.synced();
            let snapshot = latest.ok_or(EnrollmentError::NotSignedIn)?;
            match inner.phase {
                EnrollmentPhase::NotEnrolled => {}
                EnrollmentPhase::SecretGenerated | EnrollmentPhase::PendingVerification => {
                    return Err(EnrollmentError::AlreadyPending);
                }
                phase @ EnrollmentPhase::Enrolled => {
                    return Err(EnrollmentError::InvalidState(phase));
                }
            }
            if !snapshot.email_verified {
                return Err(EnrollmentError::EmailNotVerified);
            }
            snapshot.uid.clone()
        };

        let secret = match self.provider.generate_totp_secret().await {
            Ok(secret) => Arc::new(secret),
            Err(ProviderError::UnverifiedEmail) => return Err(EnrollmentError::EmailNotVerified),
            Err(ProviderError::NoCurrentUser) => return Err(EnrollmentError::NotSignedIn),
            Err(err) => {
                warn!("could not generate TOTP secret: {err}");
                return Err(EnrollmentError::Provider(err));
            }
        };

        let (mut inner, _) = self.synced();
        if inner.uid.as_deref() != Some(uid.as_str()) {
            return Err(EnrollmentError::NotSignedIn);
        }
        inner.pending = Some(secret.clone());
        inner.phase = EnrollmentPhase::SecretGenerated;
        info!("TOTP enrollment started");
        Ok(secret)
    }

    /// Submit the code shown by the authenticator app.
    ///
    /// # Errors
    /// `InvalidCode` keeps the pending secret so the user can retry. `SecretExpired`
    /// discards it. Other provider failures keep it as well.
    #[instrument(skip(self, code))]
    pub async fn verify_enrollment(
        &self,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<EnrolledFactor, EnrollmentError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let (uid, secret) = {
            let (mut inner, _) = self.synced();
            let secret = match (inner.phase, &inner.pending) {
                (
                    EnrollmentPhase::SecretGenerated | EnrollmentPhase::PendingVerification,
                    Some(secret),
                ) => secret.clone(),
                (phase, _) => return Err(EnrollmentError::InvalidState(phase)),
            };
            let code = code.trim();
            if !is_six_digit_code(code) {
                inner.phase = EnrollmentPhase::PendingVerification;
                return Err(EnrollmentError::InvalidCode);
            }
            (inner.uid.clone(), secret)
        };

        let result = self
            .provider
            .enroll_totp(&secret, code.trim(), display_name)
            .await;

        let (mut inner, _) = self.synced();
        let same_attempt = inner.uid == uid
            && inner
                .pending
                .as_ref()
                .is_some_and(|pending| pending.matches(&secret));

        match result {
            Ok(factor) => {
                if inner.uid == uid {
                    inner.pending = None;
                    if !inner.factors.iter().any(|f| f.uid == factor.uid) {
                        inner.factors.push(factor.clone());
                    }
                    inner.as_of = Utc::now();
                    inner.phase = EnrollmentPhase::Enrolled;
                }
                info!("TOTP factor enrolled");
                Ok(factor)
            }
            Err(ProviderError::InvalidVerificationCode) => {
                if same_attempt {
                    inner.phase = EnrollmentPhase::PendingVerification;
                }
                Err(EnrollmentError::InvalidCode)
            }
            Err(ProviderError::ExpiredChallenge) => {
                if same_attempt {
                    inner.pending = None;
                    inner.phase = inner.settled_phase();
                }
                Err(EnrollmentError::SecretExpired)
            }
            Err(ProviderError::NoCurrentUser) => Err(EnrollmentError::NotSignedIn),
            Err(err) => {
                warn!("TOTP enrollment verification failed: {err}");
                if same_attempt {
                    inner.phase = EnrollmentPhase::PendingVerification;
                }
                Err(EnrollmentError::Provider(err))
            }
        }
    }

    /// Remove an enrolled factor.
    ///
    /// # Errors
    /// Fails if not in the `Enrolled` state, if `factor_uid` is not enrolled, or if the
    /// provider call fails.
    #[instrument(skip(self))]
    pub async fn disenroll(&self, factor_uid: &str) -> Result<(), EnrollmentError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let uid = {
            let (inner, latest) = self.synced();
            if latest.is_none() {
                return Err(EnrollmentError::NotSignedIn);
            }
            if inner.phase != EnrollmentPhase::Enrolled {
                return Err(EnrollmentError::InvalidState(inner.phase));
            }
            if !inner.factors.iter().any(|f| f.uid == factor_uid) {
                return Err(EnrollmentError::FactorNotEnrolled);
            }
            inner.uid.clone()
        };

        match self.provider.unenroll_factor(factor_uid).await {
            Ok(()) => {}
            Err(ProviderError::FactorNotFound) => return Err(EnrollmentError::FactorNotEnrolled),
            Err(ProviderError::NoCurrentUser) => return Err(EnrollmentError::NotSignedIn),
            Err(err) => {
                warn!("could not remove factor: {err}");
                return Err(EnrollmentError::Provider(err));
            }
        }

        let (mut inner, _) = self.synced();
        if inner.uid == uid {
            inner.factors.retain(|f| f.uid != factor_uid);
            inner.as_of = Utc::now();
            if inner.pending.is_none() {
                inner.phase = inner.settled_phase();
            }
        }
        info!("TOTP factor removed");
        Ok(())
    }

    /// Discard the pending secret. Local only; nothing was committed at the provider.
    ///
    /// # Errors
    /// Fails if no secret is pending or a verification is in flight.
    pub fn cancel(&self) -> Result<(), EnrollmentError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let (mut inner, _) = self.synced();
        match inner.phase {
            EnrollmentPhase::SecretGenerated | EnrollmentPhase::PendingVerification => {
                inner.pending = None;
                inner.phase = inner.settled_phase();
                debug!("TOTP enrollment cancelled");
                Ok(())
            }
            phase => Err(EnrollmentError::InvalidState(phase)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::observer::AuthStateObserver;
    use crate::identity::memory::{FailurePoint, MemoryProvider, MemoryProviderConfig};
    use secrecy::{ExposeSecret, SecretString};
    use std::time::Duration;
    use totp_rs::{Algorithm, Secret, TOTP};

    const TEST_PRIVATE_KEY_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/signing_key.pem"
    ));

    struct Fixture {
        provider: Arc<MemoryProvider>,
        observer: AuthStateObserver,
        manager: EnrollmentManager,
        uid: String,
    }

    async fn fixture(email_verified: bool) -> Fixture {
        let provider = Arc::new(MemoryProvider::new(
            MemoryProviderConfig::new(TEST_PRIVATE_KEY_PEM.as_bytes()).expect("config"),
        ));
        let uid = provider.add_user("a@b.co", "secret1", email_verified).await;
        let observer = AuthStateObserver::new(provider.clone(), None);
        let mut rx = observer.start().await;
        provider
            .sign_in_with_password("a@b.co", &SecretString::from("secret1".to_string()))
            .await
            .expect("sign in");
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(AuthState::is_signed_in))
            .await
            .expect("timeout")
            .expect("observer");
        let manager = EnrollmentManager::new(provider.clone(), observer.watch());
        Fixture {
            provider,
            observer,
            manager,
            uid,
        }
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

    #[tokio::test]
    async fn unverified_email_is_refused_without_state_change() {
        let f = fixture(false).await;
        let err = f.manager.start_enrollment().await.expect_err("gate");
        assert!(matches!(err, EnrollmentError::EmailNotVerified));
        assert_eq!(f.manager.phase(), EnrollmentPhase::NotEnrolled);
        assert!(f.manager.pending_secret().is_none());
    }

    #[tokio::test]
    async fn gate_reads_latest_snapshot() {
        let f = fixture(false).await;
        assert!(f.manager.start_enrollment().await.is_err());

        f.provider.verify_email(&f.uid).await;
        let mut rx = f.observer.watch();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.snapshot.as_ref().is_some_and(|s| s.email_verified)),
        )
        .await
        .expect("timeout")
        .expect("observer");

        f.manager.start_enrollment().await.expect("start");
        assert_eq!(f.manager.phase(), EnrollmentPhase::SecretGenerated);
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_keeps_secret() {
        let f = fixture(true).await;
        let first = f.manager.start_enrollment().await.expect("start");
        let err = f.manager.start_enrollment().await.expect_err("second");
        assert!(matches!(err, EnrollmentError::AlreadyPending));
        let pending = f.manager.pending_secret().expect("pending");
        assert!(pending.matches(&first));
    }

    #[tokio::test]
    async fn wrong_code_keeps_secret_then_right_code_enrolls() {
        let f = fixture(true).await;
        let secret = f.manager.start_enrollment().await.expect("start");

        let err = f
            .manager
            .verify_enrollment(&wrong_code(&code_for(&secret)), None)
            .await
            .expect_err("wrong");
        assert!(matches!(err, EnrollmentError::InvalidCode));
        assert!(err.is_retryable());
        assert_eq!(f.manager.phase(), EnrollmentPhase::PendingVerification);
        assert!(
            f.manager
                .pending_secret()
                .is_some_and(|p| p.matches(&secret))
        );

        let factor = f
            .manager
            .verify_enrollment(&code_for(&secret), Some("Authenticator"))
            .await
            .expect("verify");
        assert_eq!(factor.kind, FactorKind::Totp);
        assert_eq!(f.manager.phase(), EnrollmentPhase::Enrolled);
        assert!(f.manager.pending_secret().is_none());
        assert_eq!(f.manager.enrolled_factors().len(), 1);
    }

    #[tokio::test]
    async fn malformed_code_never_reaches_provider() {
        let f = fixture(true).await;
        f.manager.start_enrollment().await.expect("start");
        let err = f
            .manager
            .verify_enrollment("12ab", None)
            .await
            .expect_err("malformed");
        assert!(matches!(err, EnrollmentError::InvalidCode));
        assert_eq!(f.manager.phase(), EnrollmentPhase::PendingVerification);
    }

    #[tokio::test]
    async fn cancel_returns_to_not_enrolled() {
        let f = fixture(true).await;
        f.manager.start_enrollment().await.expect("start");
        f.manager.cancel().expect("cancel");
        assert_eq!(f.manager.phase(), EnrollmentPhase::NotEnrolled);
        assert!(f.manager.pending_secret().is_none());
        assert!(matches!(
            f.manager.cancel(),
            Err(EnrollmentError::InvalidState(EnrollmentPhase::NotEnrolled))
        ));
        f.manager.start_enrollment().await.expect("restart");
    }

    #[tokio::test]
    async fn verify_without_pending_secret_is_invalid_state() {
        let f = fixture(true).await;
        let err = f
            .manager
            .verify_enrollment("123456", None)
            .await
            .expect_err("no secret");
        assert!(matches!(
            err,
            EnrollmentError::InvalidState(EnrollmentPhase::NotEnrolled)
        ));
    }

    #[tokio::test]
    async fn disenroll_rules() {
        let f = fixture(true).await;
        let err = f.manager.disenroll("nope").await.expect_err("not enrolled");
        assert!(matches!(
            err,
            EnrollmentError::InvalidState(EnrollmentPhase::NotEnrolled)
        ));

        let secret = f.manager.start_enrollment().await.expect("start");
        let factor = f
            .manager
            .verify_enrollment(&code_for(&secret), None)
            .await
            .expect("verify");

        let err = f.manager.disenroll("nope").await.expect_err("unknown");
        assert!(matches!(err, EnrollmentError::FactorNotEnrolled));
        assert_eq!(f.manager.phase(), EnrollmentPhase::Enrolled);

        f.manager.disenroll(&factor.uid).await.expect("disenroll");
        assert_eq!(f.manager.phase(), EnrollmentPhase::NotEnrolled);
        assert!(f.manager.enrolled_factors().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_on_start_changes_nothing() {
        let f = fixture(true).await;
        f.provider
            .fail_next(
                FailurePoint::GenerateTotpSecret,
                ProviderError::Network("offline".to_string()),
            )
            .await;
        let err = f.manager.start_enrollment().await.expect_err("offline");
        assert!(matches!(err, EnrollmentError::Provider(_)));
        assert_eq!(f.manager.phase(), EnrollmentPhase::NotEnrolled);
    }

    #[tokio::test]
    async fn sign_out_discards_pending_secret() {
        let f = fixture(true).await;
        f.manager.start_enrollment().await.expect("start");
        f.provider.sign_out().await.expect("sign out");
        let mut rx = f.observer.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| !s.is_signed_in()))
            .await
            .expect("timeout")
            .expect("observer");
        assert!(f.manager.pending_secret().is_none());
        assert_eq!(f.manager.phase(), EnrollmentPhase::NotEnrolled);
    }
}
