use crate::config::CoreConfig;
use crate::incident::{LogNotificationSink, channel, spawn_notification_worker};
use crate::risk::CidrGeoLocator;
use crate::service::{AuthService, CoreStores, ensure_signing_key, spawn_session_gc};
use crate::api;
use anyhow::Result;
use chrono::Utc;
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub geoip_table: Option<PathBuf>,
    pub config: CoreConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, no signing key can be
/// loaded or generated, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let geo = match &args.geoip_table {
        Some(path) => CidrGeoLocator::from_path(path)?,
        None => CidrGeoLocator::default(),
    };
    if geo.is_empty() {
        warn!("No geolocation table loaded, impossible travel detection is disabled");
    } else {
        info!(networks = geo.len(), "Geolocation table loaded");
    }

    let pool = match &args.dsn {
        Some(dsn) => Some(super::connect(dsn).await?),
        None => {
            warn!("No --dsn given, keys and sessions are kept in memory");
            None
        }
    };
    let stores = match &pool {
        Some(pool) => CoreStores::postgres(pool),
        None => CoreStores::memory(),
    }
    .with_geo(Arc::new(geo));

    let (notifier, rx) = channel(args.config.notification_buffer());
    let _notifications = spawn_notification_worker(rx, Arc::new(LogNotificationSink));

    let service = Arc::new(AuthService::new(args.config, stores, Some(notifier)));
    ensure_signing_key(&service, Utc::now()).await?;
    let _gc = spawn_session_gc(service.clone());

    api::new(args.port, service, pool).await
}

fn log_startup_args(args: &Args) {
    let config = &args.config;
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "store",
            if args.dsn.is_some() { "postgres" } else { "memory" }.to_string(),
        ),
        ("issuer", config.issuer().to_string()),
        ("audience", config.audience().to_string()),
        ("access_ttl", format!("{}s", config.access_ttl().num_seconds())),
        ("refresh_ttl", format!("{}s", config.refresh_ttl().num_seconds())),
        (
            "session_max_lifetime",
            format!("{}s", config.session_max_lifetime().num_seconds()),
        ),
        (
            "max_sessions_per_user",
            config
                .max_sessions_per_user()
                .filter(|max| *max > 0)
                .map_or_else(|| "unlimited".to_string(), |max| max.to_string()),
        ),
        (
            "lockout",
            format!(
                "{} attempts / {}s",
                config.lockout().max_attempts,
                config.lockout().window.num_seconds()
            ),
        ),
        (
            "geoip_table",
            args.geoip_table
                .as_ref()
                .map_or_else(|| "none".to_string(), |p| p.display().to_string()),
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", heimdall_banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn heimdall_banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    HEIMDALL_BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}

const HEIMDALL_BANNER: &str = r"
     /\
    /  \
   /____\   H E I M D A L L {VERSION}
   |    |
   |____|";
