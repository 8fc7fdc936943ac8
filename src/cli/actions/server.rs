use crate::analysis::{HttpSymptomAnalyzer, SymptomAnalyzer, UnconfiguredAnalyzer};
use crate::diagnosis::{DiagnosisStore, MemoryDiagnosisStore, PgDiagnosisStore};
use crate::server::{self, ServerSessionResolver, Services, SessionConfig, TokenVerifier};
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};
use url::Url;

/// Where session token verification keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwksLocation {
    Path(PathBuf),
    Url(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenArgs {
    pub jwks: JwksLocation,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub token: Option<TokenArgs>,
    pub session: SessionConfig,
    pub analysis_url: Option<Url>,
}

/// Build the collaborators and run the HTTP server.
/// # Errors
/// Returns an error if the database or the listener cannot be set up.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let store: Arc<dyn DiagnosisStore> = match &args.dsn {
        Some(dsn) => Arc::new(
            PgDiagnosisStore::connect(dsn)
                .await
                .context("Failed to connect to database")?,
        ),
        None => {
            warn!("No DSN configured; diagnosis history is kept in memory");
            Arc::new(MemoryDiagnosisStore::new())
        }
    };

    let verifier = verifier(args.token).await;

    let analyzer: Arc<dyn SymptomAnalyzer> = match args.analysis_url {
        Some(url) => Arc::new(
            HttpSymptomAnalyzer::new(url).context("Failed to build analysis client")?,
        ),
        None => {
            warn!("No analysis URL configured; analysis requests will fail");
            Arc::new(UnconfiguredAnalyzer)
        }
    };

    let services = Services {
        resolver: Arc::new(ServerSessionResolver::new(
            verifier,
            args.session.cookie_name(),
        )),
        session: args.session,
        store,
        analyzer,
    };

    server::new(args.port, services).await
}

/// Unusable key material leaves every caller anonymous instead of stopping the server.
async fn verifier(token: Option<TokenArgs>) -> Option<Arc<TokenVerifier>> {
    let Some(token) = token else {
        warn!("No verification keys configured; every caller is anonymous");
        return None;
    };
    match token_verifier(token).await {
        Ok(verifier) => Some(Arc::new(verifier)),
        Err(err) => {
            error!("Token verification disabled, every caller is anonymous: {err:#}");
            None
        }
    }
}

async fn token_verifier(token: TokenArgs) -> Result<TokenVerifier> {
    match token.jwks {
        JwksLocation::Path(path) => TokenVerifier::from_file(path, token.issuer, token.audience),
        JwksLocation::Url(url) => {
            TokenVerifier::new_remote(url.as_str(), token.issuer, token.audience).await
        }
    }
}

fn log_startup_args(args: &Args) {
    let (jwks, issuer, audience) = match &args.token {
        Some(token) => (
            match &token.jwks {
                JwksLocation::Path(path) => format!("file:{}", path.display()),
                JwksLocation::Url(url) => url.to_string(),
            },
            token.issuer.clone(),
            token.audience.clone(),
        ),
        None => ("none".to_string(), "n/a".to_string(), "n/a".to_string()),
    };
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_dsn),
        ),
        ("jwks", jwks),
        ("token_issuer", issuer),
        ("token_audience", audience),
        ("session_cookie", args.session.cookie_name().to_string()),
        ("session_ttl_seconds", args.session.ttl_seconds().to_string()),
        (
            "analysis_url",
            args.analysis_url
                .as_ref()
                .map_or_else(|| "none".to_string(), ToString::to_string),
        ),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} ({})\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
