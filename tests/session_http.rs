//! Session cookie round trip over real HTTP.

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::sync::Arc;
use symptoscan::analysis::{
    AnalysisError, AnalysisRequest, AnalysisResult, Condition, SymptomAnalyzer, Urgency,
};
use symptoscan::client::session_sync::{HttpSessionEndpoint, SessionEndpoint};
use symptoscan::diagnosis::{DiagnosisStore, MemoryDiagnosisStore};
use symptoscan::identity::IdentityProvider;
use symptoscan::identity::memory::{MemoryProvider, MemoryProviderConfig};
use symptoscan::server::{self, ServerSessionResolver, Services, SessionConfig, TokenVerifier};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

const TEST_PRIVATE_KEY_PEM: &str = include_str!("fixtures/signing_key.pem");
const SYMPTOMS: &str = "sore throat and mild fever since yesterday";

struct FixedAnalyzer;

#[async_trait]
impl SymptomAnalyzer for FixedAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        Ok(AnalysisResult {
            diagnosis: vec![Condition {
                name: "Pharyngitis".to_string(),
                explanation: "Inflamed throat, usually viral".to_string(),
            }],
            urgency: Urgency::Medium,
            departments: vec!["General Medicine".to_string()],
        })
    }
}

struct TestServer {
    base: Url,
    store: Arc<MemoryDiagnosisStore>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(provider: &MemoryProvider) -> Self {
        let jwks = provider.jwks().expect("jwks");
        let verifier = TokenVerifier::new(
            jwks,
            provider.config().issuer(),
            provider.config().audience(),
        );
        let session = SessionConfig::default().with_secure(false);
        let store = Arc::new(MemoryDiagnosisStore::new());
        let services = Services {
            resolver: Arc::new(ServerSessionResolver::new(
                Some(Arc::new(verifier)),
                session.cookie_name(),
            )),
            session,
            store: store.clone(),
            analyzer: Arc::new(FixedAnalyzer),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = server::serve(listener, services, async {
                let _ = rx.await;
            })
            .await;
        });

        Self {
            base: Url::parse(&format!("http://{addr}/")).expect("url"),
            store,
            shutdown: Some(tx),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base.join(path).expect("join")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn provider() -> MemoryProvider {
    MemoryProvider::new(MemoryProviderConfig::new(TEST_PRIVATE_KEY_PEM.as_bytes()).expect("config"))
}

fn cookie_pair(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn http_session_endpoint_keeps_cookie_for_backend_calls() {
    let provider = provider();
    let uid = provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    provider
        .sign_in_with_password("ana@symptoscan.dev", &SecretString::from("secret1".to_string()))
        .await
        .expect("sign in");
    let id_token = provider.id_token(false).await.expect("token");

    let server = TestServer::start(&provider).await;
    let endpoint = HttpSessionEndpoint::new(server.url("api/auth/session")).expect("endpoint");
    assert_eq!(endpoint.cookies(), None);

    endpoint.establish(&id_token).await.expect("establish");
    assert!(
        endpoint
            .cookies()
            .is_some_and(|cookies| cookies.contains("__session="))
    );

    let body: Value = endpoint
        .client()
        .post(server.url("api/analysis"))
        .json(&json!({ "symptoms": SYMPTOMS }))
        .send()
        .await
        .expect("analysis")
        .json()
        .await
        .expect("json");
    assert_eq!(body["message"], "Analysis complete and saved");
    assert_eq!(server.store.list(&uid).await.expect("history").len(), 1);

    endpoint.revoke().await.expect("revoke");
    assert_eq!(endpoint.cookies(), None);
}

#[tokio::test]
async fn cookie_from_session_endpoint_identifies_caller() {
    let provider = provider();
    let uid = provider.add_user("ana@symptoscan.dev", "secret1", true).await;
    provider
        .sign_in_with_password("ana@symptoscan.dev", &SecretString::from("secret1".to_string()))
        .await
        .expect("sign in");
    let id_token = provider.id_token(false).await.expect("token");

    let server = TestServer::start(&provider).await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("api/auth/session"))
        .json(&json!({ "idToken": id_token.expose_secret() }))
        .send()
        .await
        .expect("post session");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let set_cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie")
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(!set_cookie.contains("Secure"));

    let response = client
        .post(server.url("api/analysis"))
        .header(COOKIE, cookie_pair(&set_cookie))
        .json(&json!({ "symptoms": SYMPTOMS }))
        .send()
        .await
        .expect("post analysis");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["message"], "Analysis complete and saved");
    assert_eq!(body["result"]["urgency"], "MEDIUM");

    let history = server.store.list(&uid).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].symptoms, SYMPTOMS);
    assert_eq!(history[0].medical_history, "");

    let response = client
        .post(server.url("api/analysis"))
        .json(&json!({ "symptoms": SYMPTOMS }))
        .send()
        .await
        .expect("anonymous analysis");
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["message"], "Analysis complete");
    assert_eq!(server.store.list(&uid).await.expect("history").len(), 1);
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let provider = provider();
    let server = TestServer::start(&provider).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("health"))
        .send()
        .await
        .expect("health");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key("x-app"));
    assert!(response.headers().contains_key("x-request-id"));

    let doc: Value = client
        .get(server.url("api-docs/openapi.json"))
        .send()
        .await
        .expect("openapi")
        .json()
        .await
        .expect("json");
    assert!(doc["paths"]["/api/auth/session"]["post"].is_object());
}
