use crate::server::handlers::session::DEFAULT_COOKIE_NAME;
use clap::{Arg, ArgAction, Command};

pub const ARG_JWKS_PATH: &str = "jwks-path";
pub const ARG_JWKS_URL: &str = "jwks-url";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_TOKEN_AUDIENCE: &str = "token-audience";
pub const ARG_COOKIE_NAME: &str = "session-cookie-name";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_COOKIE_INSECURE: &str = "session-cookie-insecure";

/// Token verification material and session cookie settings.
#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWKS_PATH)
                .long(ARG_JWKS_PATH)
                .help("Path to a JWKS file used to verify session tokens")
                .env("SYMPTOSCAN_JWKS_PATH")
                .conflicts_with(ARG_JWKS_URL)
                .requires_all([ARG_TOKEN_ISSUER, ARG_TOKEN_AUDIENCE]),
        )
        .arg(
            Arg::new(ARG_JWKS_URL)
                .long(ARG_JWKS_URL)
                .help("HTTPS URL of the identity provider's JWKS")
                .long_help(
                    "HTTPS URL of the identity provider's JWKS. Without --jwks-path or --jwks-url every caller is anonymous.",
                )
                .env("SYMPTOSCAN_JWKS_URL")
                .requires_all([ARG_TOKEN_ISSUER, ARG_TOKEN_AUDIENCE]),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Expected `iss` claim of session tokens")
                .env("SYMPTOSCAN_TOKEN_ISSUER"),
        )
        .arg(
            Arg::new(ARG_TOKEN_AUDIENCE)
                .long(ARG_TOKEN_AUDIENCE)
                .help("Expected `aud` claim of session tokens")
                .env("SYMPTOSCAN_TOKEN_AUDIENCE"),
        )
        .arg(
            Arg::new(ARG_COOKIE_NAME)
                .long(ARG_COOKIE_NAME)
                .help("Name of the session cookie")
                .default_value(DEFAULT_COOKIE_NAME)
                .env("SYMPTOSCAN_SESSION_COOKIE_NAME"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session cookie Max-Age in seconds")
                .default_value("432000")
                .env("SYMPTOSCAN_SESSION_TTL_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_INSECURE)
                .long(ARG_COOKIE_INSECURE)
                .help("Omit the Secure cookie attribute (plain http development only)")
                .env("SYMPTOSCAN_SESSION_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
}
