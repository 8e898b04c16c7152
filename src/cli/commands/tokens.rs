//! Token lifetimes, session limits and store timeouts.

use crate::config::{CoreConfig, DEFAULT_AUDIENCE, DEFAULT_ISSUER};
use crate::store::StorePolicy;
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_ISSUER: &str = "issuer";
pub const ARG_AUDIENCE: &str = "audience";
pub const ARG_ACCESS_TTL: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL: &str = "refresh-ttl-seconds";
pub const ARG_SESSION_MAX_LIFETIME: &str = "session-max-lifetime-seconds";
pub const ARG_KEY_REFRESH: &str = "key-refresh-seconds";
pub const ARG_STORE_TIMEOUT: &str = "store-timeout-ms";
pub const ARG_STORE_RETRY_BACKOFF: &str = "store-retry-backoff-ms";
pub const ARG_MAX_SESSIONS: &str = "max-sessions-per-user";
pub const ARG_SESSION_GC_GRACE: &str = "session-gc-grace-seconds";
pub const ARG_SESSION_GC_INTERVAL: &str = "session-gc-interval-seconds";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub session_max_lifetime_seconds: i64,
    pub key_refresh_seconds: u64,
    pub store_timeout_ms: u64,
    pub store_retry_backoff_ms: u64,
    pub max_sessions_per_user: usize,
    pub session_gc_grace_seconds: i64,
    pub session_gc_interval_seconds: u64,
}

impl Options {
    /// Parse token and session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a required argument is missing or the TTLs are inconsistent.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_string = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        let options = Self {
            issuer: read_string(ARG_ISSUER)?,
            audience: read_string(ARG_AUDIENCE)?,
            access_ttl_seconds: matches.get_one::<i64>(ARG_ACCESS_TTL).copied().unwrap_or(900),
            refresh_ttl_seconds: matches
                .get_one::<i64>(ARG_REFRESH_TTL)
                .copied()
                .unwrap_or(2_592_000),
            session_max_lifetime_seconds: matches
                .get_one::<i64>(ARG_SESSION_MAX_LIFETIME)
                .copied()
                .unwrap_or(7_776_000),
            key_refresh_seconds: matches.get_one::<u64>(ARG_KEY_REFRESH).copied().unwrap_or(60),
            store_timeout_ms: matches
                .get_one::<u64>(ARG_STORE_TIMEOUT)
                .copied()
                .unwrap_or(2000),
            store_retry_backoff_ms: matches
                .get_one::<u64>(ARG_STORE_RETRY_BACKOFF)
                .copied()
                .unwrap_or(50),
            max_sessions_per_user: matches.get_one::<usize>(ARG_MAX_SESSIONS).copied().unwrap_or(0),
            session_gc_grace_seconds: matches
                .get_one::<i64>(ARG_SESSION_GC_GRACE)
                .copied()
                .unwrap_or(604_800),
            session_gc_interval_seconds: matches
                .get_one::<u64>(ARG_SESSION_GC_INTERVAL)
                .copied()
                .unwrap_or(3600),
        };

        if options.access_ttl_seconds > options.refresh_ttl_seconds {
            anyhow::bail!("--{ARG_ACCESS_TTL} must not exceed --{ARG_REFRESH_TTL}");
        }
        Ok(options)
    }

    #[must_use]
    pub fn apply(&self, config: CoreConfig) -> CoreConfig {
        config
            .with_issuer(self.issuer.clone())
            .with_audience(self.audience.clone())
            .with_access_ttl_seconds(self.access_ttl_seconds)
            .with_refresh_ttl_seconds(self.refresh_ttl_seconds)
            .with_session_max_lifetime_seconds(self.session_max_lifetime_seconds)
            .with_key_refresh_interval_seconds(self.key_refresh_seconds)
            .with_store_policy(StorePolicy::new(
                Duration::from_millis(self.store_timeout_ms.max(1)),
                Duration::from_millis(self.store_retry_backoff_ms),
            ))
            .with_max_sessions_per_user(Some(self.max_sessions_per_user).filter(|max| *max > 0))
            .with_session_gc_grace_seconds(self.session_gc_grace_seconds)
            .with_session_gc_interval_seconds(self.session_gc_interval_seconds)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_session_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Token issuer (iss claim)")
                .env("HEIMDALL_ISSUER")
                .global(true)
                .default_value(DEFAULT_ISSUER),
        )
        .arg(
            Arg::new(ARG_AUDIENCE)
                .long(ARG_AUDIENCE)
                .help("Token audience (aud claim)")
                .env("HEIMDALL_AUDIENCE")
                .global(true)
                .default_value(DEFAULT_AUDIENCE),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token lifetime in seconds")
                .env("HEIMDALL_ACCESS_TTL_SECONDS")
                .global(true)
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token lifetime in seconds")
                .env("HEIMDALL_REFRESH_TTL_SECONDS")
                .global(true)
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_KEY_REFRESH)
                .long(ARG_KEY_REFRESH)
                .help("How long loaded signing keys are cached, in seconds")
                .env("HEIMDALL_KEY_REFRESH_SECONDS")
                .global(true)
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT)
                .long(ARG_STORE_TIMEOUT)
                .help("Timeout for a single store call in milliseconds")
                .env("HEIMDALL_STORE_TIMEOUT_MS")
                .global(true)
                .default_value("2000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_STORE_RETRY_BACKOFF)
                .long(ARG_STORE_RETRY_BACKOFF)
                .help("Delay before retrying a transient store failure, in milliseconds")
                .env("HEIMDALL_STORE_RETRY_BACKOFF_MS")
                .global(true)
                .default_value("50")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_MAX_LIFETIME)
                .long(ARG_SESSION_MAX_LIFETIME)
                .help("Absolute session lifetime in seconds, regardless of refreshes")
                .env("HEIMDALL_SESSION_MAX_LIFETIME_SECONDS")
                .default_value("7776000")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_SESSIONS)
                .long(ARG_MAX_SESSIONS)
                .help("Maximum active sessions per user, 0 for unlimited")
                .env("HEIMDALL_MAX_SESSIONS_PER_USER")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_SESSION_GC_GRACE)
                .long(ARG_SESSION_GC_GRACE)
                .help("Keep expired sessions this many seconds before purging them")
                .env("HEIMDALL_SESSION_GC_GRACE_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_GC_INTERVAL)
                .long(ARG_SESSION_GC_INTERVAL)
                .help("Seconds between expired session purges")
                .env("HEIMDALL_SESSION_GC_INTERVAL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}
