//! Verifies identity provider ID tokens against a cached JWKS.
//!
//! The key set is either static (read from a file at startup) or fetched from a URL.
//! A remote key set is refreshed when stale or when a token names an unknown `kid`.
//! Every fetch attempt, successful or not, starts a cooldown that also covers health
//! checks, so neither a burst of forged tokens nor an unreachable provider turns into
//! one fetch per request. A failed refresh keeps the last known keys.

use crate::token::{self, IdTokenClaims, Jwks, VerificationOptions, verify_rs256};
use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

const JWKS_CACHE_TTL_SECONDS: u64 = 3600;
const JWKS_REFRESH_COOLDOWN_SECONDS: u64 = 30;
const JWKS_FETCH_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_LEEWAY_SECONDS: i64 = 60;

#[derive(Debug)]
enum JwksSource {
    Static,
    Remote { url: Url, client: Client },
}

#[derive(Debug)]
struct JwksCache {
    jwks: Jwks,
    fetched_at: Instant,
}

impl JwksCache {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < Duration::from_secs(JWKS_CACHE_TTL_SECONDS)
    }
}

/// Health of the verification material, reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    Ok,
    Error,
    Static,
}

impl DependencyStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Static => "static",
        }
    }

    #[must_use]
    pub const fn is_healthy(self) -> bool {
        !matches!(self, Self::Error)
    }
}

#[derive(Debug)]
pub struct TokenVerifier {
    source: JwksSource,
    cache: RwLock<JwksCache>,
    issuer: String,
    audience: String,
    leeway_seconds: i64,
    last_attempt_unix: AtomicU64,
    last_attempt_ok: AtomicBool,
}

impl TokenVerifier {
    /// Verifier over a fixed key set.
    #[must_use]
    pub fn new(jwks: Jwks, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            source: JwksSource::Static,
            cache: RwLock::new(JwksCache {
                jwks,
                fetched_at: Instant::now(),
            }),
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: DEFAULT_LEEWAY_SECONDS,
            last_attempt_unix: AtomicU64::new(0),
            last_attempt_ok: AtomicBool::new(true),
        }
    }

    /// Read a JWKS document from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds no keys.
    pub fn from_file(
        path: impl AsRef<Path>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read JWKS file: {}", path.display()))?;
        let jwks = Jwks::from_json(&raw).context("Invalid JWKS JSON")?;
        if jwks.is_empty() {
            return Err(anyhow!("JWKS file has no keys: {}", path.display()));
        }
        Ok(Self::new(jwks, issuer, audience))
    }

    /// Fetch the key set from `url` and keep it refreshed.
    ///
    /// Plain http is only accepted for loopback hosts. A failed first fetch is not
    /// fatal: the verifier starts with no keys and rejects every token until a
    /// refresh succeeds.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub async fn new_remote(
        url: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid JWKS URL: {url}"))?;
        let loopback = matches!(
            url.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]")
        );
        if url.scheme() != "https" && !loopback {
            return Err(anyhow!("JWKS URL must use https: {url}"));
        }
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(JWKS_FETCH_TIMEOUT_SECONDS))
            .build()
            .context("Failed to build JWKS HTTP client")?;

        let (jwks, fetched_at, ok) = match fetch_jwks(&client, &url).await {
            Ok(jwks) => (jwks, Instant::now(), true),
            Err(err) => {
                warn!(url = %url, error = %err, "JWKS fetch failed during startup; continuing with no keys");
                (Jwks { keys: Vec::new() }, stale_instant(), false)
            }
        };
        Ok(Self {
            source: JwksSource::Remote { url, client },
            cache: RwLock::new(JwksCache { jwks, fetched_at }),
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: DEFAULT_LEEWAY_SECONDS,
            last_attempt_unix: AtomicU64::new(now_unix_seconds_u64()),
            last_attempt_ok: AtomicBool::new(ok),
        })
    }

    #[must_use]
    pub fn with_leeway_seconds(mut self, leeway_seconds: i64) -> Self {
        self.leeway_seconds = leeway_seconds;
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

    #[must_use]
    pub fn jwks_url(&self) -> Option<&str> {
        match &self.source {
            JwksSource::Static => None,
            JwksSource::Remote { url, .. } => Some(url.as_str()),
        }
    }

    async fn snapshot(&self) -> Jwks {
        let (cached, fresh) = {
            let cache = self.cache.read().await;
            (cache.jwks.clone(), cache.is_fresh())
        };
        if fresh || !self.refresh_throttled("stale").await {
            return cached;
        }
        self.cache.read().await.jwks.clone()
    }

    fn cooling_down(&self) -> bool {
        let last = self.last_attempt_unix.load(Ordering::Relaxed);
        now_unix_seconds_u64().saturating_sub(last) < JWKS_REFRESH_COOLDOWN_SECONDS
    }

    async fn refresh(&self) -> Result<()> {
        let JwksSource::Remote { url, client } = &self.source else {
            return Ok(());
        };
        self.last_attempt_unix
            .store(now_unix_seconds_u64(), Ordering::Relaxed);
        let fetched = fetch_jwks(client, url).await;
        self.last_attempt_ok
            .store(fetched.is_ok(), Ordering::Relaxed);
        let jwks = fetched?;
        let mut cache = self.cache.write().await;
        cache.jwks = jwks;
        cache.fetched_at = Instant::now();
        info!(keys = cache.jwks.keys.len(), "JWKS cache refreshed");
        Ok(())
    }

    /// Refresh a remote key set unless an attempt was made within the cooldown.
    /// Returns whether new keys were loaded.
    async fn refresh_throttled(&self, reason: &str) -> bool {
        if matches!(self.source, JwksSource::Static) || self.cooling_down() {
            return false;
        }
        match self.refresh().await {
            Ok(()) => true,
            Err(err) => {
                debug!(reason, "JWKS refresh failed, keeping cached keys: {err}");
                false
            }
        }
    }

    /// State of the verification material.
    ///
    /// A remote key set is only fetched when it is stale and out of cooldown; otherwise
    /// the outcome of the last attempt is reported.
    pub async fn dependency_status(&self) -> DependencyStatus {
        let JwksSource::Remote { url, .. } = &self.source else {
            return DependencyStatus::Static;
        };
        let fresh = self.cache.read().await.is_fresh();
        if !fresh
            && !self.cooling_down()
            && let Err(err) = self.refresh().await
        {
            warn!(url = %url, error = %err, "JWKS fetch failed during health check");
        }
        if self.last_attempt_ok.load(Ordering::Relaxed) {
            DependencyStatus::Ok
        } else {
            DependencyStatus::Error
        }
    }

    fn options(&self) -> VerificationOptions<'_> {
        VerificationOptions {
            issuer: &self.issuer,
            audience: &self.audience,
            now_unix_seconds: now_unix_seconds(),
            leeway_seconds: self.leeway_seconds,
        }
    }

    /// Verify signature and claims. On an unknown `kid` the key set is refreshed once.
    ///
    /// # Errors
    /// Returns the verification failure. Refresh problems surface as the original error.
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, token::Error> {
        let jwks = self.snapshot().await;
        match verify_rs256(token, &jwks, &self.options()) {
            Err(token::Error::UnknownKid(kid)) => {
                if self.refresh_throttled("unknown kid").await {
                    let jwks = self.cache.read().await.jwks.clone();
                    verify_rs256(token, &jwks, &self.options())
                } else {
                    Err(token::Error::UnknownKid(kid))
                }
            }
            result => result,
        }
    }
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn now_unix_seconds_u64() -> u64 {
    u64::try_from(now_unix_seconds()).unwrap_or(0)
}

fn stale_instant() -> Instant {
    Instant::now()
        .checked_sub(Duration::from_secs(JWKS_CACHE_TTL_SECONDS + 1))
        .unwrap_or_else(Instant::now)
}

async fn fetch_jwks(client: &Client, url: &Url) -> Result<Jwks> {
    let span = info_span!("jwks.fetch", http.method = "GET", url = %url);
    async {
        let response = client.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("JWKS fetch failed: {status}"));
        }
        let jwks = Jwks::from_json(&body).context("Invalid JWKS JSON")?;
        if jwks.is_empty() {
            return Err(anyhow!("JWKS has no keys"));
        }
        Ok(jwks)
    }
    .instrument(span)
    .await
}
