//! End-to-end client flows against the in-memory identity provider.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use symptoscan::client::frontends::SignInOutcome;
use symptoscan::client::frontends::email_link::{EmailLinkSignIn, LinkCompletion};
use symptoscan::client::frontends::password::PasswordSignIn;
use symptoscan::client::mfa::{EnrollmentManager, EnrollmentPhase, MfaChallengeResolver};
use symptoscan::client::observer::{AuthState, AuthStateObserver};
use symptoscan::client::pending_email::{MemoryStore, PendingEmailStore};
use symptoscan::client::session_sync::{MemorySessionEndpoint, SessionSync};
use symptoscan::client::sign_out;
use symptoscan::identity::memory::{MemoryProvider, MemoryProviderConfig, MessageKind};
use symptoscan::identity::{IdentityProvider, TotpSecret};
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use totp_rs::{Algorithm, Secret, TOTP};
use url::Url;

const TEST_PRIVATE_KEY_PEM: &str = include_str!("fixtures/signing_key.pem");
const APP_URL: &str = "https://app.symptoscan.local/";

struct App {
    provider: Arc<MemoryProvider>,
    endpoint: Arc<MemorySessionEndpoint>,
    observer: Arc<AuthStateObserver>,
    sync: symptoscan::client::session_sync::SessionSyncHandle,
    rx: watch::Receiver<AuthState>,
}

impl App {
    async fn start(provider: Arc<MemoryProvider>) -> Self {
        let endpoint = Arc::new(MemorySessionEndpoint::new());
        let sync = SessionSync::spawn(provider.clone(), endpoint.clone());
        let observer = Arc::new(AuthStateObserver::new(
            provider.clone(),
            Some(sync.clone()),
        ));
        let rx = observer.start().await;
        let mut app = Self {
            provider,
            endpoint,
            observer,
            sync,
            rx,
        };
        app.wait_for(|state| !state.is_loading).await;
        app
    }

    async fn wait_for<F>(&mut self, mut f: F) -> AuthState
    where
        F: FnMut(&AuthState) -> bool,
    {
        timeout(Duration::from_secs(5), self.rx.wait_for(|state| f(state)))
            .await
            .expect("timed out waiting for auth state")
            .expect("observer stopped")
            .clone()
    }

    async fn wait_signed_in(&mut self) -> AuthState {
        let state = self.wait_for(AuthState::is_signed_in).await;
        self.sync.flush().await;
        state
    }

    async fn wait_signed_out(&mut self) -> AuthState {
        let state = self.wait_for(|state| !state.is_signed_in()).await;
        self.sync.flush().await;
        state
    }
}

fn provider() -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new(
        MemoryProviderConfig::new(TEST_PRIVATE_KEY_PEM.as_bytes()).expect("config"),
    ))
}

fn password(value: &str) -> SecretString {
    SecretString::from(value.to_string())
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
async fn password_sign_in_without_factors_needs_no_challenge() {
    let provider = provider();
    provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    let mut app = App::start(provider.clone()).await;
    assert!(!app.endpoint.has_cookie());

    let outcome = PasswordSignIn::new(provider.clone())
        .sign_in("ana@symptoscan.dev", &password("secret1"))
        .await;
    assert!(outcome.is_signed_in());

    let state = app.wait_signed_in().await;
    let snapshot = state.snapshot.expect("snapshot");
    assert!(snapshot.enrolled_factors.is_empty());
    assert_eq!(provider.outstanding_challenges().await, 0);
    assert!(app.endpoint.has_cookie());
}

#[tokio::test]
async fn cookie_follows_identity_across_sign_in_and_out() {
    let provider = provider();
    provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    let mut app = App::start(provider.clone()).await;
    let frontend = PasswordSignIn::new(provider.clone());

    for _ in 0..3 {
        assert!(
            frontend
                .sign_in("ana@symptoscan.dev", &password("secret1"))
                .await
                .is_signed_in()
        );
        app.wait_signed_in().await;
        assert!(app.endpoint.has_cookie());

        sign_out(provider.as_ref()).await.expect("sign out");
        app.wait_signed_out().await;
        assert!(!app.endpoint.has_cookie());
    }
    assert!(app.observer.snapshot().is_none());
}

#[tokio::test]
async fn totp_enrollment_then_step_up_sign_in() {
    let provider = provider();
    provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    let mut app = App::start(provider.clone()).await;
    let frontend = PasswordSignIn::new(provider.clone());

    assert!(
        frontend
            .sign_in("ana@symptoscan.dev", &password("secret1"))
            .await
            .is_signed_in()
    );
    app.wait_signed_in().await;

    let enrollment = EnrollmentManager::new(provider.clone(), app.observer.watch());
    let secret = enrollment.start_enrollment().await.expect("secret");
    let factor = enrollment
        .verify_enrollment(&code_for(&secret), Some("Authenticator"))
        .await
        .expect("enrolled");
    assert_eq!(enrollment.phase(), EnrollmentPhase::Enrolled);

    sign_out(provider.as_ref()).await.expect("sign out");
    app.wait_signed_out().await;

    let challenge = match frontend
        .sign_in("ana@symptoscan.dev", &password("secret1"))
        .await
    {
        SignInOutcome::StepUpRequired(challenge) => challenge,
        other => panic!("expected step-up, got {other:?}"),
    };
    assert_eq!(challenge.hints.len(), 1);
    assert_eq!(challenge.hints[0].factor_uid, factor.uid);

    let resolver = MfaChallengeResolver::new(provider.clone());
    resolver.begin(challenge).expect("begin");

    let right = code_for(&secret);
    resolver
        .submit(&wrong_code(&right))
        .await
        .expect_err("wrong code");
    assert!(resolver.is_outstanding());

    let snapshot = resolver.submit(&code_for(&secret)).await.expect("signed in");
    assert_eq!(snapshot.enrolled_factors.len(), 1);
    assert!(!resolver.is_outstanding());

    let state = app.wait_signed_in().await;
    assert_eq!(
        state.snapshot.map(|s| s.enrolled_factors.len()),
        Some(1)
    );
    assert!(app.endpoint.has_cookie());
}

#[tokio::test]
async fn email_link_opened_on_another_device_asks_for_email() {
    let provider = provider();
    let continue_url = Url::parse(APP_URL).expect("url");

    let device_a = EmailLinkSignIn::new(
        provider.clone(),
        Arc::new(MemoryStore::new()),
        continue_url.clone(),
    );
    device_a.send_link("ana@symptoscan.dev").await.expect("sent");
    let link = provider
        .last_message(MessageKind::EmailSignInLink, "ana@symptoscan.dev")
        .await
        .expect("link");

    let store_b = Arc::new(MemoryStore::new());
    let device_b = EmailLinkSignIn::new(provider.clone(), store_b.clone(), continue_url);
    assert!(matches!(
        device_b.complete(&link).await,
        LinkCompletion::NeedsEmail
    ));

    let outcome = device_b
        .complete_with_email(&link, "ana@symptoscan.dev")
        .await;
    assert!(outcome.is_signed_in());
    assert_eq!(store_b.load().expect("load"), None);
}

#[tokio::test]
async fn unreachable_session_endpoint_does_not_block_sign_in() {
    let provider = provider();
    provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    let mut app = App::start(provider.clone()).await;
    app.endpoint.set_unreachable(true);

    let outcome = PasswordSignIn::new(provider.clone())
        .sign_in("ana@symptoscan.dev", &password("secret1"))
        .await;
    assert!(outcome.is_signed_in());

    let state = app.wait_signed_in().await;
    assert!(state.is_signed_in());
    assert_eq!(state.last_error, None);
    assert!(!app.endpoint.has_cookie());
    assert!(provider.current_user().await.is_some());
}
