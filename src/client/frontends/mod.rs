//! Primary sign-in surfaces.
//!
//! Every front-end returns a [`SignInOutcome`] so callers handle the step-up branch
//! explicitly instead of treating it as a failure.

pub mod email_link;
pub mod federated;
pub mod password;
pub mod phone;

use crate::identity::{IdentitySnapshot, MfaChallenge, ProviderError};
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Form fields that validation can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Email,
    Password,
    PhoneNumber,
    Code,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid {field:?}: {message}")]
    InvalidInput { field: Field, message: &'static str },
    #[error("invalid credential")]
    InvalidCredential,
    #[error("user not found")]
    UserNotFound,
    #[error("no account for this email address")]
    UnknownEmail,
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("password is too weak")]
    WeakPassword,
    #[error("invalid verification code")]
    InvalidCode,
    #[error("verification code expired")]
    CodeExpired,
    #[error("invalid or expired sign-in link")]
    InvalidLink,
    #[error("account exists with a different credential")]
    AccountExistsWithDifferentCredential,
    #[error("federated sign-in failed: {0}")]
    FederatedSignInFailed(String),
    #[error("proof-of-humanity check failed")]
    HumanityCheckFailed,
    #[error("verification code could not be sent: {0}")]
    CodeNotSent(String),
    #[error("too many requests")]
    TooManyRequests,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected provider error: {0}")]
    Unexpected(String),
}

impl CredentialError {
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidInput { message, .. } => *message,
            Self::InvalidCredential | Self::UserNotFound => {
                "Invalid email or password. Please try again."
            }
            Self::UnknownEmail => "No user found with this email address.",
            Self::EmailAlreadyInUse => "This email is already in use. Please log in instead.",
            Self::WeakPassword => "Password must be at least 6 characters long.",
            Self::InvalidCode => "The code you entered is incorrect. Please try again.",
            Self::CodeExpired => "The code has expired. Please request a new one.",
            Self::InvalidLink => "The sign-in link is invalid or has expired.",
            Self::AccountExistsWithDifferentCredential => {
                "An account already exists with this email address. Please sign in with the original method."
            }
            Self::FederatedSignInFailed(_) => {
                "An error occurred during Google Sign-In. Please try again."
            }
            Self::HumanityCheckFailed | Self::CodeNotSent(_) => {
                "Failed to send verification code. Please try again."
            }
            Self::TooManyRequests => "Too many attempts. Please wait a moment and try again.",
            Self::Network(_) | Self::Unexpected(_) => {
                "An authentication error occurred. Please try again."
            }
        }
    }
}

impl From<ProviderError> for CredentialError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredential => Self::InvalidCredential,
            ProviderError::UserNotFound => Self::UserNotFound,
            ProviderError::EmailAlreadyInUse => Self::EmailAlreadyInUse,
            ProviderError::WeakPassword => Self::WeakPassword,
            ProviderError::InvalidVerificationCode => Self::InvalidCode,
            ProviderError::ExpiredChallenge => Self::CodeExpired,
            ProviderError::InvalidActionCode => Self::InvalidLink,
            ProviderError::AccountExistsWithDifferentCredential => {
                Self::AccountExistsWithDifferentCredential
            }
            ProviderError::CaptchaCheckFailed => Self::HumanityCheckFailed,
            ProviderError::TooManyRequests => Self::TooManyRequests,
            ProviderError::Network(msg) => Self::Network(msg),
            other => {
                warn!("unexpected provider error during sign-in: {other}");
                Self::Unexpected(other.to_string())
            }
        }
    }
}

/// Result of a primary sign-in attempt.
#[derive(Debug)]
pub enum SignInOutcome {
    SignedIn(IdentitySnapshot),
    /// Credentials were valid; hand the challenge to the MFA resolver.
    StepUpRequired(MfaChallenge),
    Rejected(CredentialError),
}

impl SignInOutcome {
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn(_))
    }
}

impl From<Result<IdentitySnapshot, ProviderError>> for SignInOutcome {
    fn from(result: Result<IdentitySnapshot, ProviderError>) -> Self {
        match result {
            Ok(snapshot) => Self::SignedIn(snapshot),
            Err(ProviderError::MultiFactorRequired(challenge)) => Self::StepUpRequired(challenge),
            Err(err) => Self::Rejected(err.into()),
        }
    }
}

impl From<CredentialError> for SignInOutcome {
    fn from(err: CredentialError) -> Self {
        Self::Rejected(err)
    }
}

fn invalid(field: Field, message: &'static str) -> CredentialError {
    CredentialError::InvalidInput { field, message }
}

pub(crate) fn valid_email(email: &str) -> Result<&str, CredentialError> {
    let email = email.trim();
    if Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email)) {
        Ok(email)
    } else {
        Err(invalid(Field::Email, "Please enter a valid email address."))
    }
}

pub(crate) fn valid_phone(phone: &str) -> Result<&str, CredentialError> {
    let phone = phone.trim();
    if phone.len() < 10 {
        return Err(invalid(
            Field::PhoneNumber,
            "Please enter a valid phone number with country code.",
        ));
    }
    if Regex::new(r"^\+[1-9]\d{1,14}$").is_ok_and(|re| re.is_match(phone)) {
        Ok(phone)
    } else {
        Err(invalid(
            Field::PhoneNumber,
            "Include country code (e.g., +14155552671)",
        ))
    }
}

pub(crate) fn valid_code(code: &str) -> Result<&str, CredentialError> {
    let code = code.trim();
    if code.is_empty() {
        Err(invalid(Field::Code, "Please enter the verification code."))
    } else if crate::client::mfa::is_six_digit_code(code) {
        Ok(code)
    } else {
        Err(invalid(Field::Code, "OTP must be 6 digits."))
    }
}
