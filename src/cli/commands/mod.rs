pub mod guard;
pub mod logging;
pub mod risk;
pub mod tokens;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const CMD_ROTATE_KEY: &str = "rotate-key";
pub const CMD_PRUNE_KEYS: &str = "prune-keys";

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

    let command = Command::new("heimdall")
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
                .env("HEIMDALL_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help(
                    "Database connection string. Without it the server keeps keys, sessions and counters in memory, which only suits a single development node.",
                )
                .env("HEIMDALL_DSN")
                .global(true),
        )
        .subcommand(
            Command::new(CMD_ROTATE_KEY)
                .about("Generate a new signing key and retire the active one"),
        )
        .subcommand(
            Command::new(CMD_PRUNE_KEYS)
                .about("Delete retired signing keys that are no longer published"),
        );

    let command = tokens::with_args(command);
    let command = guard::with_args(command);
    let command = risk::with_args(command);
    logging::with_args(command)
}
