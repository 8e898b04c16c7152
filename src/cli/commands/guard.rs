//! Lockout and rate-limit arguments.

use crate::config::CoreConfig;
use crate::guard::{LockoutPolicy, RateLimit, RateLimitPolicy};
use crate::incident::IncidentPolicy;
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

pub const ARG_LOCKOUT_MAX_ATTEMPTS: &str = "lockout-max-attempts";
pub const ARG_LOCKOUT_WINDOW: &str = "lockout-window-seconds";
pub const ARG_LOCKOUT_DURATION: &str = "lockout-duration-seconds";
pub const ARG_RATE_LIMIT_LOGIN: &str = "rate-limit-login";
pub const ARG_RATE_LIMIT_REFRESH: &str = "rate-limit-refresh";
pub const ARG_RATE_LIMIT_MFA: &str = "rate-limit-mfa";
pub const ARG_RATE_LIMIT_BACKUP_CODE: &str = "rate-limit-backup-code";
pub const ARG_REVOKE_ALL_THRESHOLD: &str = "incident-revoke-all-threshold";
pub const ARG_REVERIFY_THRESHOLD: &str = "incident-reverify-threshold";
pub const ARG_NOTIFY_THRESHOLD: &str = "incident-notify-threshold";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub lockout: LockoutPolicy,
    pub rate_limits: RateLimitPolicy,
    pub incident: IncidentPolicy,
}

impl Options {
    /// Parse lockout, rate-limit and incident arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the incident thresholds are not ordered.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let defaults = RateLimitPolicy::default();
        let limit = |id: &str, fallback: RateLimit| {
            matches.get_one::<RateLimit>(id).copied().unwrap_or(fallback)
        };
        let seconds = |id: &str, fallback: i64| {
            Duration::seconds(matches.get_one::<i64>(id).copied().unwrap_or(fallback))
        };
        let threshold = |id: &str, fallback: u32| {
            matches.get_one::<u32>(id).copied().unwrap_or(fallback)
        };

        let incident = IncidentPolicy {
            revoke_all_threshold: threshold(ARG_REVOKE_ALL_THRESHOLD, 90),
            reverify_threshold: threshold(ARG_REVERIFY_THRESHOLD, 70),
            notify_threshold: threshold(ARG_NOTIFY_THRESHOLD, 50),
        };
        if incident.notify_threshold > incident.reverify_threshold
            || incident.reverify_threshold > incident.revoke_all_threshold
        {
            anyhow::bail!(
                "incident thresholds must satisfy notify <= reverify <= revoke-all, got {} / {} / {}",
                incident.notify_threshold,
                incident.reverify_threshold,
                incident.revoke_all_threshold
            );
        }

        Ok(Self {
            lockout: LockoutPolicy {
                max_attempts: matches
                    .get_one::<u32>(ARG_LOCKOUT_MAX_ATTEMPTS)
                    .copied()
                    .unwrap_or(5),
                window: seconds(ARG_LOCKOUT_WINDOW, 900),
                lockout: seconds(ARG_LOCKOUT_DURATION, 900),
            },
            rate_limits: RateLimitPolicy {
                login: limit(ARG_RATE_LIMIT_LOGIN, defaults.login),
                refresh: limit(ARG_RATE_LIMIT_REFRESH, defaults.refresh),
                mfa_verify: limit(ARG_RATE_LIMIT_MFA, defaults.mfa_verify),
                backup_code_verify: limit(ARG_RATE_LIMIT_BACKUP_CODE, defaults.backup_code_verify),
            },
            incident,
        })
    }

    #[must_use]
    pub fn apply(&self, config: CoreConfig) -> CoreConfig {
        config
            .with_lockout(self.lockout)
            .with_rate_limits(self.rate_limits)
            .with_incident_policy(self.incident)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_lockout_args(command);
    let command = with_rate_limit_args(command);
    with_incident_args(command)
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_MAX_ATTEMPTS)
                .long(ARG_LOCKOUT_MAX_ATTEMPTS)
                .help("Failed attempts inside the window before the account locks")
                .env("HEIMDALL_LOCKOUT_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_WINDOW)
                .long(ARG_LOCKOUT_WINDOW)
                .help("Window in seconds in which failures are counted")
                .env("HEIMDALL_LOCKOUT_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_DURATION)
                .long(ARG_LOCKOUT_DURATION)
                .help("How long a locked account stays locked, in seconds")
                .env("HEIMDALL_LOCKOUT_DURATION_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_LOGIN)
                .long(ARG_RATE_LIMIT_LOGIN)
                .help("Login rate limit as HITS/SECONDS per client IP")
                .env("HEIMDALL_RATE_LIMIT_LOGIN")
                .default_value("10/60")
                .value_parser(clap::value_parser!(RateLimit)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_REFRESH)
                .long(ARG_RATE_LIMIT_REFRESH)
                .help("Refresh rate limit as HITS/SECONDS per client IP")
                .env("HEIMDALL_RATE_LIMIT_REFRESH")
                .default_value("30/60")
                .value_parser(clap::value_parser!(RateLimit)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MFA)
                .long(ARG_RATE_LIMIT_MFA)
                .help("MFA verification rate limit as HITS/SECONDS")
                .env("HEIMDALL_RATE_LIMIT_MFA")
                .default_value("5/300")
                .value_parser(clap::value_parser!(RateLimit)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_BACKUP_CODE)
                .long(ARG_RATE_LIMIT_BACKUP_CODE)
                .help("Backup code rate limit as HITS/SECONDS")
                .env("HEIMDALL_RATE_LIMIT_BACKUP_CODE")
                .default_value("3/900")
                .value_parser(clap::value_parser!(RateLimit)),
        )
}

fn with_incident_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_REVOKE_ALL_THRESHOLD)
                .long(ARG_REVOKE_ALL_THRESHOLD)
                .help("Risk score at which an incident revokes every session of the user")
                .env("HEIMDALL_INCIDENT_REVOKE_ALL_THRESHOLD")
                .default_value("90")
                .value_parser(clap::value_parser!(u32).range(0..=100)),
        )
        .arg(
            Arg::new(ARG_REVERIFY_THRESHOLD)
                .long(ARG_REVERIFY_THRESHOLD)
                .help("Risk score at which an incident requires re-verification")
                .env("HEIMDALL_INCIDENT_REVERIFY_THRESHOLD")
                .default_value("70")
                .value_parser(clap::value_parser!(u32).range(0..=100)),
        )
        .arg(
            Arg::new(ARG_NOTIFY_THRESHOLD)
                .long(ARG_NOTIFY_THRESHOLD)
                .help("Risk score at which an incident notifies the user")
                .env("HEIMDALL_INCIDENT_NOTIFY_THRESHOLD")
                .default_value("50")
                .value_parser(clap::value_parser!(u32).range(0..=100)),
        )
}
