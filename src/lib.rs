//! # SymptoScan identity and session core
//!
//! `symptoscan` keeps a client-side notion of "who is signed in" consistent with a
//! server-side session cookie, and layers TOTP step-up authentication on top of the
//! primary sign-in methods (password, phone one-time code, email link, federated
//! redirect).
//!
//! ## Flow Overview
//!
//! 1. A credential front-end (`client::frontends`) asks the identity provider to sign in.
//!    The provider either succeeds, rejects the credential, or interrupts with an MFA
//!    challenge that `client::mfa::challenge` completes.
//! 2. The provider emits a new identity. `client::observer` replaces its snapshot and
//!    fires a session sync command.
//! 3. `client::session_sync` processes commands one at a time, in order, posting the ID
//!    token to the session endpoint (`server::handlers::session`) or deleting the cookie.
//! 4. Backend actions call `server::resolver` to turn the cookie into a verified caller.
//!    Anything that fails verification is treated as an anonymous caller.
//!
//! ## Security boundaries
//!
//! - Bearer tokens, passwords and TOTP secrets are `SecretString`s and never logged.
//! - The server only holds public verification material (`token::Jwks`).
//! - Session sync and token verification failures are logged and absorbed; they never
//!   block sign-in or anonymous use of the analysis action.

pub mod analysis;
pub mod cli;
pub mod client;
pub mod diagnosis;
pub mod identity;
pub mod server;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
