use crate::cli::actions::{
    Action,
    server::{Args, JwksLocation, TokenArgs},
};
use crate::cli::commands::{self, session};
use crate::server::SessionConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches.get_one::<String>(commands::ARG_DSN).cloned();
    let analysis_url = matches.get_one::<Url>(commands::ARG_ANALYSIS_URL).cloned();

    let mut config = SessionConfig::default()
        .with_secure(!matches.get_flag(session::ARG_COOKIE_INSECURE));
    if let Some(name) = matches.get_one::<String>(session::ARG_COOKIE_NAME) {
        config = config.with_cookie_name(name);
    }
    if let Some(ttl) = matches.get_one::<u64>(session::ARG_SESSION_TTL) {
        config = config.with_ttl_seconds(*ttl);
    }

    Ok(Action::Server(Args {
        port,
        dsn,
        token: token_args(matches)?,
        session: config,
        analysis_url,
    }))
}

fn token_args(matches: &clap::ArgMatches) -> Result<Option<TokenArgs>> {
    let jwks = if let Some(path) = matches.get_one::<String>(session::ARG_JWKS_PATH) {
        JwksLocation::Path(PathBuf::from(path))
    } else if let Some(url) = matches.get_one::<String>(session::ARG_JWKS_URL) {
        JwksLocation::Url(Url::parse(url).context("invalid SYMPTOSCAN_JWKS_URL")?)
    } else {
        return Ok(None);
    };

    let issuer = matches
        .get_one::<String>(session::ARG_TOKEN_ISSUER)
        .cloned()
        .context("missing required argument: --token-issuer")?;
    let audience = matches
        .get_one::<String>(session::ARG_TOKEN_AUDIENCE)
        .cloned()
        .context("missing required argument: --token-audience")?;

    Ok(Some(TokenArgs {
        jwks,
        issuer,
        audience,
    }))
}
