use crate::cli::actions::{
    Action,
    keys::{self, KeyOperation},
    server,
};
use crate::cli::commands::{self, guard, risk, tokens};
use crate::config::CoreConfig;
use anyhow::{Context, Result};
use secrecy::SecretString;

fn dsn(matches: &clap::ArgMatches) -> Option<SecretString> {
    matches
        .get_one::<String>(commands::ARG_DSN)
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.clone()))
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((name, _)) => {
            let operation = match name {
                commands::CMD_ROTATE_KEY => KeyOperation::Rotate,
                commands::CMD_PRUNE_KEYS => KeyOperation::Prune,
                other => anyhow::bail!("unknown subcommand: {other}"),
            };
            // Session args live on the root command only; global values given
            // after the subcommand are propagated up to the root matches.
            let dsn = dsn(matches).context("missing required argument: --dsn")?;
            let config = tokens::Options::parse(matches)?.apply(CoreConfig::new());
            Ok(Action::Keys(keys::Args {
                operation,
                dsn,
                config,
            }))
        }
        None => {
            let port = matches
                .get_one::<u16>(commands::ARG_PORT)
                .copied()
                .unwrap_or(8080);
            let risk = risk::Options::parse(matches)?;
            let config = tokens::Options::parse(matches)?.apply(CoreConfig::new());
            let config = guard::Options::parse(matches)?.apply(config);
            let config = risk.apply(config);

            Ok(Action::Server(server::Args {
                port,
                dsn: dsn(matches),
                geoip_table: risk.geoip_table,
                config,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const CLEAR: [(&str, Option<&str>); 4] = [
        ("HEIMDALL_DSN", None),
        ("HEIMDALL_ACCESS_TTL_SECONDS", None),
        ("HEIMDALL_REFRESH_TTL_SECONDS", None),
        ("HEIMDALL_MAX_SESSIONS_PER_USER", None),
    ];

    #[test]
    fn server_without_dsn_uses_memory() -> Result<()> {
        temp_env::with_vars(CLEAR, || {
            let matches = commands::new().get_matches_from(vec![
                "heimdall",
                "--access-ttl-seconds",
                "300",
                "--max-sessions-per-user",
                "3",
            ]);
            let Action::Server(args) = handler(&matches)? else {
                anyhow::bail!("expected server action");
            };
            assert!(args.dsn.is_none());
            assert_eq!(args.config.access_ttl(), chrono::Duration::seconds(300));
            assert_eq!(args.config.max_sessions_per_user(), Some(3));
            Ok(())
        })
    }

    #[test]
    fn access_ttl_longer_than_refresh_is_rejected() {
        temp_env::with_vars(CLEAR, || {
            let matches = commands::new().get_matches_from(vec![
                "heimdall",
                "--access-ttl-seconds",
                "7200",
                "--refresh-ttl-seconds",
                "3600",
            ]);
            assert!(handler(&matches).is_err());
        });
    }

    #[test]
    fn rotate_key_requires_dsn() -> Result<()> {
        temp_env::with_vars(CLEAR, || {
            let matches = commands::new().get_matches_from(vec!["heimdall", "rotate-key"]);
            assert!(handler(&matches).is_err());

            let matches = commands::new().get_matches_from(vec![
                "heimdall",
                "prune-keys",
                "--dsn",
                "postgres://localhost/heimdall",
            ]);
            let Action::Keys(args) = handler(&matches)? else {
                anyhow::bail!("expected keys action");
            };
            assert_eq!(args.operation, KeyOperation::Prune);
            assert_eq!(args.dsn.expose_secret(), "postgres://localhost/heimdall");
            Ok(())
        })
    }

    #[test]
    fn rotate_key_reads_token_lifetimes() -> Result<()> {
        temp_env::with_vars(CLEAR, || {
            let matches = commands::new().get_matches_from(vec![
                "heimdall",
                "--max-sessions-per-user",
                "2",
                "rotate-key",
                "--dsn",
                "postgres://localhost/heimdall",
                "--refresh-ttl-seconds",
                "86400",
            ]);
            let Action::Keys(args) = handler(&matches)? else {
                anyhow::bail!("expected keys action");
            };
            assert_eq!(args.operation, KeyOperation::Rotate);
            assert_eq!(args.config.refresh_ttl(), chrono::Duration::seconds(86_400));
            assert_eq!(args.config.max_sessions_per_user(), Some(2));
            Ok(())
        })
    }
}
