pub mod logging;
pub mod session;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_ANALYSIS_URL: &str = "analysis-url";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("symptoscan")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("SYMPTOSCAN_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string for diagnosis history")
                .long_help(
                    "Postgres connection string for diagnosis history. Without it history is kept in memory and lost on restart.",
                )
                .env("SYMPTOSCAN_DSN"),
        )
        .arg(
            Arg::new(ARG_ANALYSIS_URL)
                .long(ARG_ANALYSIS_URL)
                .help("URL of the symptom analysis service")
                .env("SYMPTOSCAN_ANALYSIS_URL")
                .value_parser(clap::value_parser!(url::Url)),
        );

    let command = session::with_args(command);
    logging::with_args(command)
}
