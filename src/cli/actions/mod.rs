pub mod keys;
pub mod server;

// Internal "interpreter" for `Action`.
mod run;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::info;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Keys(keys::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}

/// Connect the shared Postgres pool.
///
/// # Errors
/// Returns an error if the DSN is invalid or the database is unreachable.
pub(crate) async fn connect(dsn: &SecretString) -> Result<PgPool> {
    let options =
        PgConnectOptions::from_str(dsn.expose_secret()).context("Invalid database DSN")?;

    info!(
        host = options.get_host(),
        port = options.get_port(),
        database = options.get_database().unwrap_or("default"),
        "Connecting to database"
    );

    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .context("Failed to connect to database")
}
