//! Contract with the hosted identity provider.
//!
//! Everything the application needs from the provider goes through the
//! [`IdentityProvider`] trait so the client components can be driven by the
//! in-process [`memory::MemoryProvider`] in tests and local development.
//!
//! ## Snapshots
//!
//! The provider pushes [`AuthStateEvent`]s to subscribers. Each `Changed` event carries
//! a complete [`IdentitySnapshot`] (or `None` when nobody is signed in). Snapshots are
//! immutable values; a new one replaces the previous one wholesale.
//!
//! ## Step-up
//!
//! When a primary credential is valid but a second factor is enrolled, sign-in calls
//! fail with [`ProviderError::MultiFactorRequired`] carrying an [`MfaChallenge`]. The
//! challenge owns its [`ResolverHandle`], which is neither `Clone` nor `Copy`, so only
//! one holder can ever attempt to resolve it.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Second factor methods the provider can enroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorKind {
    Totp,
    Phone,
}

impl FactorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledFactor {
    pub uid: String,
    pub kind: FactorKind,
    pub display_name: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// The application's belief about the signed-in principal at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub phone_number: Option<String>,
    pub enrolled_factors: Vec<EnrolledFactor>,
    /// When the provider produced this snapshot.
    pub observed_at: DateTime<Utc>,
}

impl IdentitySnapshot {
    #[must_use]
    pub fn factor(&self, factor_uid: &str) -> Option<&EnrolledFactor> {
        self.enrolled_factors.iter().find(|f| f.uid == factor_uid)
    }

    #[must_use]
    pub fn has_totp(&self) -> bool {
        self.enrolled_factors
            .iter()
            .any(|f| f.kind == FactorKind::Totp)
    }
}

/// Opaque reference to one outstanding sign-in challenge.
pub struct ResolverHandle(String);

impl ResolverHandle {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResolverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResolverHandle(..)")
    }
}

/// Identifies an enrolled second factor the user can answer the challenge with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaHint {
    pub factor_uid: String,
    pub kind: FactorKind,
    pub display_name: Option<String>,
}

/// Produced by the provider when a primary credential needs a second factor.
#[derive(Debug)]
pub struct MfaChallenge {
    pub handle: ResolverHandle,
    pub hints: Vec<MfaHint>,
}

/// Second factor answer scoped to one hint.
#[derive(Debug)]
pub struct MfaAssertion {
    pub factor_uid: String,
    pub code: SecretString,
}

impl MfaAssertion {
    #[must_use]
    pub fn totp(hint: &MfaHint, code: &str) -> Self {
        Self {
            factor_uid: hint.factor_uid.clone(),
            code: SecretString::from(code.to_string()),
        }
    }
}

/// A freshly generated TOTP shared secret and its `otpauth://` provisioning URI.
///
/// Both values are sensitive and redacted from `Debug` output.
#[derive(Debug)]
pub struct TotpSecret {
    secret_base32: SecretString,
    provisioning_uri: SecretString,
}

impl TotpSecret {
    #[must_use]
    pub fn new(secret_base32: String, provisioning_uri: String) -> Self {
        Self {
            secret_base32: SecretString::from(secret_base32),
            provisioning_uri: SecretString::from(provisioning_uri),
        }
    }

    #[must_use]
    pub fn secret_base32(&self) -> &SecretString {
        &self.secret_base32
    }

    /// URI rendered as a scannable code by the caller.
    #[must_use]
    pub fn provisioning_uri(&self) -> &SecretString {
        &self.provisioning_uri
    }

    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.secret_base32.expose_secret() == other.secret_base32.expose_secret()
    }
}

/// A solved proof-of-humanity challenge. Consumed by the phone code send step.
pub struct HumanityProof(String);

impl HumanityProof {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for HumanityProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HumanityProof(..)")
    }
}

/// Returned by the phone code send step; used to confirm the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneVerificationId(String);

impl PhoneVerificationId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederatedProvider {
    Google,
}

impl FederatedProvider {
    #[must_use]
    pub const fn provider_id(self) -> &'static str {
        match self {
            Self::Google => "google.com",
        }
    }
}

#[derive(Debug)]
pub enum AuthStateEvent {
    Changed(Option<IdentitySnapshot>),
    Error(ProviderError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("user not found")]
    UserNotFound,
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("password is too weak")]
    WeakPassword,
    #[error("account exists with a different credential")]
    AccountExistsWithDifferentCredential,
    #[error("invalid verification code")]
    InvalidVerificationCode,
    #[error("second factor required")]
    MultiFactorRequired(MfaChallenge),
    #[error("challenge expired")]
    ExpiredChallenge,
    #[error("unknown or consumed resolver handle")]
    InvalidResolverHandle,
    #[error("invalid or expired action code")]
    InvalidActionCode,
    #[error("proof-of-humanity check failed")]
    CaptchaCheckFailed,
    #[error("second factor not enrolled")]
    FactorNotFound,
    #[error("too many requests")]
    TooManyRequests,
    #[error("email address is not verified")]
    UnverifiedEmail,
    #[error("no user is signed in")]
    NoCurrentUser,
    #[error("network error: {0}")]
    Network(String),
    #[error("internal provider error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether the failure is about the code the user typed rather than the flow.
    #[must_use]
    pub const fn is_invalid_code(&self) -> bool {
        matches!(self, Self::InvalidVerificationCode)
    }
}

/// Operations the application consumes from the identity provider.
///
/// Sign-in operations return the new identity on success. The provider additionally
/// pushes the same identity to every subscriber.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register for state changes. The current state is delivered immediately.
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<AuthStateEvent>;

    async fn current_user(&self) -> Option<IdentitySnapshot>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IdentitySnapshot, ProviderError>;

    async fn create_user_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IdentitySnapshot, ProviderError>;

    async fn send_password_reset_email(&self, email: &str) -> Result<(), ProviderError>;

    /// Issue a proof-of-humanity challenge and return its solved proof.
    async fn solve_humanity_challenge(&self) -> Result<HumanityProof, ProviderError>;

    async fn send_phone_code(
        &self,
        phone_number: &str,
        proof: HumanityProof,
    ) -> Result<PhoneVerificationId, ProviderError>;

    async fn confirm_phone_code(
        &self,
        verification: &PhoneVerificationId,
        code: &str,
    ) -> Result<IdentitySnapshot, ProviderError>;

    async fn send_email_link(&self, email: &str, continue_url: &Url)
    -> Result<(), ProviderError>;

    fn is_email_sign_in_link(&self, link: &str) -> bool;

    async fn sign_in_with_email_link(
        &self,
        email: &str,
        link: &str,
    ) -> Result<IdentitySnapshot, ProviderError>;

    /// Start a federated sign-in. Returns the URL the application navigates to.
    async fn sign_in_with_redirect(&self, provider: FederatedProvider)
    -> Result<Url, ProviderError>;

    /// Resolve the outcome of a redirect that brought the user back, if any.
    async fn get_redirect_result(&self) -> Result<Option<IdentitySnapshot>, ProviderError>;

    async fn id_token(&self, force_refresh: bool) -> Result<SecretString, ProviderError>;

    async fn generate_totp_secret(&self) -> Result<TotpSecret, ProviderError>;

    async fn enroll_totp(
        &self,
        secret: &TotpSecret,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<EnrolledFactor, ProviderError>;

    async fn unenroll_factor(&self, factor_uid: &str) -> Result<(), ProviderError>;

    async fn resolve_mfa_sign_in(
        &self,
        handle: &ResolverHandle,
        assertion: MfaAssertion,
    ) -> Result<IdentitySnapshot, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> IdentitySnapshot {
        IdentitySnapshot {
            uid: "u1".to_string(),
            email: Some("a@b.co".to_string()),
            email_verified: true,
            phone_number: None,
            enrolled_factors: vec![EnrolledFactor {
                uid: "f1".to_string(),
                kind: FactorKind::Totp,
                display_name: Some("Authenticator".to_string()),
                enrolled_at: Utc::now(),
            }],
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn factor_lookup() {
        let s = snapshot();
        assert!(s.has_totp());
        assert!(s.factor("f1").is_some());
        assert!(s.factor("f2").is_none());
    }

    #[test]
    fn sensitive_values_are_redacted() {
        let secret = TotpSecret::new(
            "JBSWY3DPEHPK3PXP".to_string(),
            "otpauth://totp/SymptoScan:a@b.co?secret=JBSWY3DPEHPK3PXP".to_string(),
        );
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));

        let handle = ResolverHandle::new("opaque-handle");
        assert_eq!(format!("{handle:?}"), "ResolverHandle(..)");

        let proof = HumanityProof::new("proof-token-123");
        assert_eq!(format!("{proof:?}"), "HumanityProof(..)");
    }

    #[test]
    fn factor_kind_serializes_lowercase() {
        let json = serde_json::to_string(&FactorKind::Totp).ok();
        assert_eq!(json.as_deref(), Some("\"totp\""));
    }
}
