//! In-process identity provider.
//!
//! Implements the full [`IdentityProvider`] contract against in-memory accounts so the
//! client components can run without the hosted provider. ID tokens are real RS256
//! JWTs signed with the configured key, which lets the server side verify them with
//! [`MemoryProvider::jwks`].
//!
//! Codes and links that a real provider would deliver by SMS or email land in an
//! outbox readable through [`MemoryProvider::sent_messages`].

use super::{
    AuthStateEvent, EnrolledFactor, FactorKind, FederatedProvider, HumanityProof,
    IdentityProvider, IdentitySnapshot, MfaAssertion, MfaChallenge, MfaHint,
    PhoneVerificationId, ProviderError, ResolverHandle, TotpSecret,
};
use crate::token::{self, IdTokenClaims, Jwks};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;
use ulid::Ulid;
use url::Url;

const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 300;
const DEFAULT_ID_TOKEN_TTL_SECONDS: i64 = 3600;
const MIN_PASSWORD_LENGTH: usize = 6;

#[derive(Debug, Clone)]
pub struct MemoryProviderConfig {
    signing_key_pem: Vec<u8>,
    kid: String,
    issuer: String,
    audience: String,
    totp_issuer: String,
    auth_domain: String,
    challenge_ttl: Duration,
    id_token_ttl_seconds: i64,
}

impl MemoryProviderConfig {
    /// # Errors
    /// Returns an error if the signing key cannot be parsed.
    pub fn new(signing_key_pem: impl Into<Vec<u8>>) -> Result<Self, token::Error> {
        let signing_key_pem = signing_key_pem.into();
        // Fail early on an unusable key instead of at the first id_token() call.
        Jwks::from_rsa_private_key_pem_or_der(&signing_key_pem, "memory-1")?;
        Ok(Self {
            signing_key_pem,
            kid: "memory-1".to_string(),
            issuer: "https://securetoken.symptoscan.local".to_string(),
            audience: "symptoscan".to_string(),
            totp_issuer: "SymptoScan".to_string(),
            auth_domain: "https://auth.symptoscan.local".to_string(),
            challenge_ttl: Duration::from_secs(DEFAULT_CHALLENGE_TTL_SECONDS),
            id_token_ttl_seconds: DEFAULT_ID_TOKEN_TTL_SECONDS,
        })
    }

    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = kid.into();
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    #[must_use]
    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_id_token_ttl_seconds(mut self, ttl: i64) -> Self {
        self.id_token_ttl_seconds = ttl;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }
}

/// Places where a test can make the next call fail or stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    SendPhoneCode,
    SendEmailLink,
    IdToken,
    ResolveMfa,
    RedirectResult,
    GenerateTotpSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PhoneCode,
    EmailSignInLink,
    PasswordReset,
}

/// A code or link the provider "delivered".
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub to: String,
    pub body: String,
}

struct StoredFactor {
    factor: EnrolledFactor,
    secret: Vec<u8>,
}

struct Account {
    uid: String,
    email: Option<String>,
    password: Option<SecretString>,
    email_verified: bool,
    phone_number: Option<String>,
    factors: Vec<StoredFactor>,
    federated: HashSet<&'static str>,
}

impl Account {
    fn new(email: Option<String>) -> Self {
        Self {
            uid: Ulid::new().to_string(),
            email,
            password: None,
            email_verified: false,
            phone_number: None,
            factors: Vec::new(),
            federated: HashSet::new(),
        }
    }

    fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            uid: self.uid.clone(),
            email: self.email.clone(),
            email_verified: self.email_verified,
            phone_number: self.phone_number.clone(),
            enrolled_factors: self.factors.iter().map(|f| f.factor.clone()).collect(),
            observed_at: Utc::now(),
        }
    }
}

struct PendingChallenge {
    uid: String,
    created_at: Instant,
}

struct PendingTotp {
    uid: String,
    secret: Vec<u8>,
}

struct PhoneSession {
    phone_number: String,
    code: String,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    current: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<AuthStateEvent>>,
    challenges: HashMap<String, PendingChallenge>,
    pending_totp: HashMap<String, PendingTotp>,
    phone_sessions: HashMap<String, PhoneSession>,
    email_links: HashMap<String, String>,
    humanity_tokens: HashSet<String>,
    redirect_started: Option<FederatedProvider>,
    redirect_returned: Option<(FederatedProvider, String)>,
    failures: HashMap<FailurePoint, ProviderError>,
    delays: HashMap<FailurePoint, Duration>,
    challenge_ttl: Duration,
    outbox: Vec<OutboundMessage>,
}

impl State {
    fn find_by_email(&self, email: &str) -> Option<&Account> {
        self.accounts.values().find(|a| {
            a.email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(email))
        })
    }

    fn uid_by_email(&self, email: &str) -> Option<String> {
        self.find_by_email(email).map(|a| a.uid.clone())
    }

    fn uid_by_phone(&self, phone_number: &str) -> Option<String> {
        self.accounts
            .values()
            .find(|a| a.phone_number.as_deref() == Some(phone_number))
            .map(|a| a.uid.clone())
    }

    fn current_account(&self) -> Result<&Account, ProviderError> {
        self.current
            .as_ref()
            .and_then(|uid| self.accounts.get(uid))
            .ok_or(ProviderError::NoCurrentUser)
    }

    fn current_account_mut(&mut self) -> Result<&mut Account, ProviderError> {
        let uid = self.current.clone().ok_or(ProviderError::NoCurrentUser)?;
        self.accounts
            .get_mut(&uid)
            .ok_or(ProviderError::NoCurrentUser)
    }

    fn insert(&mut self, account: Account) -> String {
        let uid = account.uid.clone();
        self.accounts.insert(uid.clone(), account);
        uid
    }

    fn take_failure(&mut self, point: FailurePoint) -> Result<(), ProviderError> {
        match self.failures.remove(&point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn current_snapshot(&self) -> Option<IdentitySnapshot> {
        self.current
            .as_ref()
            .and_then(|uid| self.accounts.get(uid))
            .map(Account::snapshot)
    }

    fn emit(&mut self) {
        let snapshot = self.current_snapshot();
        self.subscribers
            .retain(|tx| tx.send(AuthStateEvent::Changed(snapshot.clone())).is_ok());
    }

    /// Finish a primary sign-in: either sign the account in or raise a step-up challenge.
    fn complete_primary(&mut self, uid: &str) -> Result<IdentitySnapshot, ProviderError> {
        let account = self.accounts.get(uid).ok_or(ProviderError::UserNotFound)?;

        if !account.factors.is_empty() {
            let ttl = self.challenge_ttl;
            self.challenges
                .retain(|_, pending| pending.created_at.elapsed() < ttl);
            let hints = account
                .factors
                .iter()
                .map(|f| MfaHint {
                    factor_uid: f.factor.uid.clone(),
                    kind: f.factor.kind,
                    display_name: f.factor.display_name.clone(),
                })
                .collect();
            let handle = Ulid::new().to_string();
            self.challenges.insert(
                handle.clone(),
                PendingChallenge {
                    uid: uid.to_string(),
                    created_at: Instant::now(),
                },
            );
            debug!("second factor required, challenge issued");
            return Err(ProviderError::MultiFactorRequired(MfaChallenge {
                handle: ResolverHandle::new(handle),
                hints,
            }));
        }

        let snapshot = account.snapshot();
        self.current = Some(uid.to_string());
        self.emit();
        Ok(snapshot)
    }
}

pub struct MemoryProvider {
    config: MemoryProviderConfig,
    state: Mutex<State>,
}

impl MemoryProvider {
    #[must_use]
    pub fn new(config: MemoryProviderConfig) -> Self {
        let state = State {
            challenge_ttl: config.challenge_ttl,
            ..State::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryProviderConfig {
        &self.config
    }

    /// Public verification material for tokens minted by this provider.
    ///
    /// # Errors
    /// Returns an error if the signing key cannot be parsed.
    pub fn jwks(&self) -> Result<Jwks, token::Error> {
        Jwks::from_rsa_private_key_pem_or_der(&self.config.signing_key_pem, &self.config.kid)
    }

    /// Register an email/password account and return its uid.
    pub async fn add_user(&self, email: &str, password: &str, email_verified: bool) -> String {
        let mut account = Account::new(Some(email.to_string()));
        account.password = Some(SecretString::from(password.to_string()));
        account.email_verified = email_verified;
        self.state.lock().await.insert(account)
    }

    /// Mark the account's email as verified and notify subscribers if it is signed in.
    pub async fn verify_email(&self, uid: &str) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(uid) {
            account.email_verified = true;
        }
        if state.current.as_deref() == Some(uid) {
            state.emit();
        }
    }

    /// Simulate the browser coming back from the federated provider as `email`.
    pub async fn complete_redirect(&self, email: &str) {
        let mut state = self.state.lock().await;
        let provider = state
            .redirect_started
            .take()
            .unwrap_or(FederatedProvider::Google);
        state.redirect_returned = Some((provider, email.to_string()));
    }

    /// Make the next call at `point` fail with `error`.
    pub async fn fail_next(&self, point: FailurePoint, error: ProviderError) {
        self.state.lock().await.failures.insert(point, error);
    }

    /// Hold the next call at `point` for `delay` before it runs.
    pub async fn delay_next(&self, point: FailurePoint, delay: Duration) {
        self.state.lock().await.delays.insert(point, delay);
    }

    /// Deliver a state-stream error to every subscriber.
    pub async fn emit_error(&self, message: &str) {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|tx| {
            tx.send(AuthStateEvent::Error(ProviderError::Network(
                message.to_string(),
            )))
            .is_ok()
        });
    }

    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.outbox.clone()
    }

    /// Most recent message body sent to `to` with the given kind.
    pub async fn last_message(&self, kind: MessageKind, to: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .rev()
            .find(|m| m.kind == kind && m.to.eq_ignore_ascii_case(to))
            .map(|m| m.body.clone())
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    pub async fn outstanding_challenges(&self) -> usize {
        self.state.lock().await.challenges.len()
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP, ProviderError> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(self.config.totp_issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| ProviderError::Internal(format!("TOTP init error: {e}")))
    }

    fn check_totp(&self, secret: &[u8], code: &str) -> Result<bool, ProviderError> {
        self.totp(secret.to_vec(), "user")?
            .check_current(code)
            .map_err(|e| ProviderError::Internal(format!("clock error: {e}")))
    }

    fn auth_url(&self, path: &str) -> Result<Url, ProviderError> {
        Url::parse(&format!("{}{path}", self.config.auth_domain.trim_end_matches('/')))
            .map_err(|e| ProviderError::Internal(format!("invalid auth domain: {e}")))
    }
}

fn oob_code(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let mut mode = None;
    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "mode" => mode = Some(value.into_owned()),
            "oobCode" => code = Some(value.into_owned()),
            _ => {}
        }
    }
    if mode.as_deref() == Some("signIn") {
        code.filter(|c| !c.is_empty())
    } else {
        None
    }
}

fn six_digit_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

#[async_trait]
impl IdentityProvider for MemoryProvider {
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<AuthStateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        let _ = tx.send(AuthStateEvent::Changed(state.current_snapshot()));
        state.subscribers.push(tx);
        rx
    }

    async fn current_user(&self) -> Option<IdentitySnapshot> {
        self.state.lock().await.current_snapshot()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IdentitySnapshot, ProviderError> {
        let mut state = self.state.lock().await;
        let account = state
            .find_by_email(email)
            .ok_or(ProviderError::InvalidCredential)?;
        let matches = account
            .password
            .as_ref()
            .is_some_and(|p| p.expose_secret() == password.expose_secret());
        if !matches {
            return Err(ProviderError::InvalidCredential);
        }
        let uid = account.uid.clone();
        state.complete_primary(&uid)
    }

    async fn create_user_with_password(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<IdentitySnapshot, ProviderError> {
        let mut state = self.state.lock().await;
        if state.find_by_email(email).is_some() {
            return Err(ProviderError::EmailAlreadyInUse);
        }
        if password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ProviderError::WeakPassword);
        }
        let mut account = Account::new(Some(email.to_string()));
        account.password = Some(password.clone());
        let uid = state.insert(account);
        state.complete_primary(&uid)
    }

    async fn send_password_reset_email(&self, email: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.find_by_email(email).is_none() {
            return Err(ProviderError::UserNotFound);
        }
        let mut link = self.auth_url("/__/auth/action")?;
        link.query_pairs_mut()
            .append_pair("mode", "resetPassword")
            .append_pair("oobCode", &Ulid::new().to_string());
        state.outbox.push(OutboundMessage {
            kind: MessageKind::PasswordReset,
            to: email.to_string(),
            body: link.to_string(),
        });
        Ok(())
    }

    async fn solve_humanity_challenge(&self) -> Result<HumanityProof, ProviderError> {
        let token = Ulid::new().to_string();
        self.state
            .lock()
            .await
            .humanity_tokens
            .insert(token.clone());
        Ok(HumanityProof::new(token))
    }

    async fn send_phone_code(
        &self,
        phone_number: &str,
        proof: HumanityProof,
    ) -> Result<PhoneVerificationId, ProviderError> {
        let mut state = self.state.lock().await;
        // A proof is spent as soon as the provider sees it, whatever happens next.
        if !state.humanity_tokens.remove(&proof.into_inner()) {
            return Err(ProviderError::CaptchaCheckFailed);
        }
        state.take_failure(FailurePoint::SendPhoneCode)?;

        let verification_id = Ulid::new().to_string();
        let code = six_digit_code();
        state.phone_sessions.insert(
            verification_id.clone(),
            PhoneSession {
                phone_number: phone_number.to_string(),
                code: code.clone(),
            },
        );
        state.outbox.push(OutboundMessage {
            kind: MessageKind::PhoneCode,
            to: phone_number.to_string(),
            body: code,
        });
        Ok(PhoneVerificationId::new(verification_id))
    }

    async fn confirm_phone_code(
        &self,
        verification: &PhoneVerificationId,
        code: &str,
    ) -> Result<IdentitySnapshot, ProviderError> {
        let mut state = self.state.lock().await;
        let session = state
            .phone_sessions
            .get(verification.as_str())
            .ok_or(ProviderError::ExpiredChallenge)?;
        if session.code != code {
            return Err(ProviderError::InvalidVerificationCode);
        }
        let phone_number = session.phone_number.clone();
        state.phone_sessions.remove(verification.as_str());

        let uid = match state.uid_by_phone(&phone_number) {
            Some(uid) => uid,
            None => {
                let mut account = Account::new(None);
                account.phone_number = Some(phone_number);
                state.insert(account)
            }
        };
        state.complete_primary(&uid)
    }

    async fn send_email_link(&self, email: &str, continue_url: &Url) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.take_failure(FailurePoint::SendEmailLink)?;
        let code = Ulid::new().to_string();
        let mut link = self.auth_url("/__/auth/action")?;
        link.query_pairs_mut()
            .append_pair("mode", "signIn")
            .append_pair("oobCode", &code)
            .append_pair("continueUrl", continue_url.as_str());
        state.email_links.insert(code, email.to_string());
        state.outbox.push(OutboundMessage {
            kind: MessageKind::EmailSignInLink,
            to: email.to_string(),
            body: link.to_string(),
        });
        Ok(())
    }

    fn is_email_sign_in_link(&self, link: &str) -> bool {
        oob_code(link).is_some()
    }

    async fn sign_in_with_email_link(
        &self,
        email: &str,
        link: &str,
    ) -> Result<IdentitySnapshot, ProviderError> {
        let code = oob_code(link).ok_or(ProviderError::InvalidActionCode)?;
        let mut state = self.state.lock().await;
        let addressed_to = state
            .email_links
            .get(&code)
            .ok_or(ProviderError::InvalidActionCode)?;
        if !addressed_to.eq_ignore_ascii_case(email) {
            return Err(ProviderError::InvalidActionCode);
        }
        state.email_links.remove(&code);

        let uid = match state.uid_by_email(email) {
            Some(uid) => uid,
            None => state.insert(Account::new(Some(email.to_string()))),
        };
        if let Some(account) = state.accounts.get_mut(&uid) {
            account.email_verified = true;
        }
        state.complete_primary(&uid)
    }

    async fn sign_in_with_redirect(
        &self,
        provider: FederatedProvider,
    ) -> Result<Url, ProviderError> {
        let mut state = self.state.lock().await;
        state.redirect_started = Some(provider);
        let mut url = self.auth_url("/__/auth/handler")?;
        url.query_pairs_mut()
            .append_pair("providerId", provider.provider_id());
        Ok(url)
    }

    async fn get_redirect_result(&self) -> Result<Option<IdentitySnapshot>, ProviderError> {
        let mut state = self.state.lock().await;
        let Some((provider, email)) = state.redirect_returned.take() else {
            return Ok(None);
        };
        state.take_failure(FailurePoint::RedirectResult)?;

        let uid = match state.uid_by_email(&email) {
            Some(uid) => {
                let linked = state
                    .accounts
                    .get(&uid)
                    .is_some_and(|a| a.federated.contains(provider.provider_id()));
                let has_password = state
                    .accounts
                    .get(&uid)
                    .is_some_and(|a| a.password.is_some());
                if !linked && has_password {
                    return Err(ProviderError::AccountExistsWithDifferentCredential);
                }
                uid
            }
            None => state.insert(Account::new(Some(email.clone()))),
        };
        if let Some(account) = state.accounts.get_mut(&uid) {
            account.federated.insert(provider.provider_id());
            account.email_verified = true;
        }
        state.complete_primary(&uid).map(Some)
    }

    async fn id_token(&self, _force_refresh: bool) -> Result<SecretString, ProviderError> {
        let mut state = self.state.lock().await;
        state.take_failure(FailurePoint::IdToken)?;
        let account = state.current_account()?;
        let now = Utc::now().timestamp();
        let mut extra = serde_json::Map::new();
        extra.insert("auth_time".to_string(), serde_json::json!(now));
        if let Some(phone) = &account.phone_number {
            extra.insert("phone_number".to_string(), serde_json::json!(phone));
        }
        let claims = IdTokenClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: account.uid.clone(),
            exp: now + self.config.id_token_ttl_seconds,
            iat: now,
            email: account.email.clone(),
            email_verified: account.email_verified,
            extra,
        };
        let token = token::sign_rs256(&self.config.signing_key_pem, &self.config.kid, &claims)
            .map_err(|e| ProviderError::Internal(format!("token signing failed: {e}")))?;
        Ok(SecretString::from(token))
    }

    async fn generate_totp_secret(&self) -> Result<TotpSecret, ProviderError> {
        let mut state = self.state.lock().await;
        state.take_failure(FailurePoint::GenerateTotpSecret)?;
        let account = state.current_account()?;
        if !account.email_verified {
            return Err(ProviderError::UnverifiedEmail);
        }
        let uid = account.uid.clone();
        let label = account.email.clone().unwrap_or_else(|| uid.clone());

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| ProviderError::Internal(format!("secret generation failed: {e}")))?;
        let totp = self.totp(secret_bytes.clone(), &label)?;
        let secret_base32 = totp.get_secret_base32();
        let uri = totp.get_url();

        state.pending_totp.insert(
            secret_base32.clone(),
            PendingTotp {
                uid,
                secret: secret_bytes,
            },
        );
        Ok(TotpSecret::new(secret_base32, uri))
    }

    async fn enroll_totp(
        &self,
        secret: &TotpSecret,
        code: &str,
        display_name: Option<&str>,
    ) -> Result<EnrolledFactor, ProviderError> {
        let mut state = self.state.lock().await;
        let uid = state.current_account()?.uid.clone();
        let pending = state
            .pending_totp
            .get(secret.secret_base32().expose_secret())
            .filter(|p| p.uid == uid)
            .ok_or(ProviderError::ExpiredChallenge)?;
        if !self.check_totp(&pending.secret, code)? {
            return Err(ProviderError::InvalidVerificationCode);
        }
        let secret_bytes = pending.secret.clone();
        state
            .pending_totp
            .remove(secret.secret_base32().expose_secret());

        let factor = EnrolledFactor {
            uid: Ulid::new().to_string(),
            kind: FactorKind::Totp,
            display_name: display_name.map(ToString::to_string),
            enrolled_at: Utc::now(),
        };
        state.current_account_mut()?.factors.push(StoredFactor {
            factor: factor.clone(),
            secret: secret_bytes,
        });
        state.emit();
        Ok(factor)
    }

    async fn unenroll_factor(&self, factor_uid: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let account = state.current_account_mut()?;
        let before = account.factors.len();
        account.factors.retain(|f| f.factor.uid != factor_uid);
        if account.factors.len() == before {
            return Err(ProviderError::FactorNotFound);
        }
        state.emit();
        Ok(())
    }

    async fn resolve_mfa_sign_in(
        &self,
        handle: &ResolverHandle,
        assertion: MfaAssertion,
    ) -> Result<IdentitySnapshot, ProviderError> {
        let delay = self
            .state
            .lock()
            .await
            .delays
            .remove(&FailurePoint::ResolveMfa);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.take_failure(FailurePoint::ResolveMfa)?;
        let challenge = state
            .challenges
            .get(handle.as_str())
            .ok_or(ProviderError::InvalidResolverHandle)?;
        if challenge.created_at.elapsed() >= self.config.challenge_ttl {
            state.challenges.remove(handle.as_str());
            return Err(ProviderError::ExpiredChallenge);
        }
        let uid = challenge.uid.clone();
        let secret = state
            .accounts
            .get(&uid)
            .and_then(|a| {
                a.factors
                    .iter()
                    .find(|f| f.factor.uid == assertion.factor_uid)
            })
            .map(|f| f.secret.clone())
            .ok_or(ProviderError::FactorNotFound)?;
        if !self.check_totp(&secret, assertion.code.expose_secret())? {
            return Err(ProviderError::InvalidVerificationCode);
        }

        state.challenges.remove(handle.as_str());
        let snapshot = state
            .accounts
            .get(&uid)
            .map(Account::snapshot)
            .ok_or(ProviderError::UserNotFound)?;
        state.current = Some(uid);
        state.emit();
        Ok(snapshot)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.current = None;
        state.emit();
        Ok(())
    }
}
