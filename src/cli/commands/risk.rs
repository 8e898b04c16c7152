//! Risk scoring, geolocation and notification arguments.

use crate::config::CoreConfig;
use crate::risk::RiskConfig;
use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use ipnetwork::IpNetwork;
use std::path::PathBuf;

pub const ARG_SUSPICIOUS_THRESHOLD: &str = "risk-suspicious-threshold";
pub const ARG_DENY_THRESHOLD: &str = "risk-deny-threshold";
pub const ARG_MAX_TRAVEL_SPEED: &str = "max-travel-speed-kmh";
pub const ARG_FLAGGED_NETWORKS: &str = "flagged-networks";
pub const ARG_GEOIP_TABLE: &str = "geoip-table";
pub const ARG_NOTIFICATION_BUFFER: &str = "notification-buffer";

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub suspicious_threshold: u32,
    pub deny_threshold: u32,
    pub max_travel_speed_kmh: f64,
    pub flagged_networks: Vec<IpNetwork>,
    pub geoip_table: Option<PathBuf>,
    pub notification_buffer: usize,
}

impl Options {
    /// Parse risk arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a flagged network is not valid CIDR or the thresholds are inverted.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let flagged_networks = matches
            .get_one::<String>(ARG_FLAGGED_NETWORKS)
            .map(|value| parse_networks(value))
            .transpose()?
            .unwrap_or_default();

        let options = Self {
            suspicious_threshold: matches
                .get_one::<u32>(ARG_SUSPICIOUS_THRESHOLD)
                .copied()
                .unwrap_or(50),
            deny_threshold: matches
                .get_one::<u32>(ARG_DENY_THRESHOLD)
                .copied()
                .unwrap_or(90),
            max_travel_speed_kmh: matches
                .get_one::<f64>(ARG_MAX_TRAVEL_SPEED)
                .copied()
                .unwrap_or(900.0),
            flagged_networks,
            geoip_table: matches
                .get_one::<String>(ARG_GEOIP_TABLE)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            notification_buffer: matches
                .get_one::<u64>(ARG_NOTIFICATION_BUFFER)
                .copied()
                .map_or(Ok(1024), usize::try_from)
                .context("--notification-buffer is too large")?,
        };

        if options.suspicious_threshold > options.deny_threshold {
            anyhow::bail!("--{ARG_SUSPICIOUS_THRESHOLD} must not exceed --{ARG_DENY_THRESHOLD}");
        }
        if !options.max_travel_speed_kmh.is_finite() || options.max_travel_speed_kmh <= 0.0 {
            anyhow::bail!("--{ARG_MAX_TRAVEL_SPEED} must be a positive number");
        }
        Ok(options)
    }

    #[must_use]
    pub fn apply(&self, config: CoreConfig) -> CoreConfig {
        let mut risk: RiskConfig = config.risk().clone();
        risk.suspicious_threshold = self.suspicious_threshold;
        risk.deny_threshold = self.deny_threshold;
        risk.travel.max_speed_kmh = self.max_travel_speed_kmh;
        risk.flagged_networks.clone_from(&self.flagged_networks);
        config
            .with_risk(risk)
            .with_notification_buffer(self.notification_buffer)
    }
}

fn parse_networks(value: &str) -> anyhow::Result<Vec<IpNetwork>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<IpNetwork>()
                .with_context(|| format!("invalid network in --{ARG_FLAGGED_NETWORKS}: {part}"))
        })
        .collect()
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SUSPICIOUS_THRESHOLD)
                .long(ARG_SUSPICIOUS_THRESHOLD)
                .help("Risk score at which a login is flagged as suspicious")
                .env("HEIMDALL_RISK_SUSPICIOUS_THRESHOLD")
                .default_value("50")
                .value_parser(clap::value_parser!(u32).range(0..=100)),
        )
        .arg(
            Arg::new(ARG_DENY_THRESHOLD)
                .long(ARG_DENY_THRESHOLD)
                .help("Risk score at which a login is denied")
                .env("HEIMDALL_RISK_DENY_THRESHOLD")
                .default_value("90")
                .value_parser(clap::value_parser!(u32).range(0..=100)),
        )
        .arg(
            Arg::new(ARG_MAX_TRAVEL_SPEED)
                .long(ARG_MAX_TRAVEL_SPEED)
                .help("Travel speed in km/h above which two logins are impossible")
                .env("HEIMDALL_MAX_TRAVEL_SPEED_KMH")
                .default_value("900")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_FLAGGED_NETWORKS)
                .long(ARG_FLAGGED_NETWORKS)
                .help("Comma separated CIDR networks that add risk, e.g. known proxies")
                .env("HEIMDALL_FLAGGED_NETWORKS"),
        )
        .arg(
            Arg::new(ARG_GEOIP_TABLE)
                .long(ARG_GEOIP_TABLE)
                .help("JSON file mapping CIDR networks to coordinates")
                .env("HEIMDALL_GEOIP_TABLE"),
        )
        .arg(
            Arg::new(ARG_NOTIFICATION_BUFFER)
                .long(ARG_NOTIFICATION_BUFFER)
                .help("Pending security notifications kept before new ones are dropped")
                .env("HEIMDALL_NOTIFICATION_BUFFER")
                .default_value("1024")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_networks_skips_blanks() -> anyhow::Result<()> {
        let networks = parse_networks("10.0.0.0/8, ,2001:db8::/32")?;
        assert_eq!(networks.len(), 2);
        assert!(parse_networks("10.0.0.0/8,nope").is_err());
        Ok(())
    }
}
