//! Operator key management: rotation and pruning run outside request handling.

use crate::config::CoreConfig;
use crate::token::{KeyRing, PgKeyStore, TokenIssuer};
use anyhow::Result;
use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperation {
    Rotate,
    Prune,
}

#[derive(Debug)]
pub struct Args {
    pub operation: KeyOperation,
    pub dsn: SecretString,
    pub config: CoreConfig,
}

/// Execute a key management operation against the durable key store.
/// # Errors
/// Returns an error if the database is unreachable or the key store update fails.
pub async fn execute(args: Args) -> Result<()> {
    let pool = super::connect(&args.dsn).await?;
    let ring = Arc::new(KeyRing::new(
        Arc::new(PgKeyStore::new(pool.clone())),
        args.config.store_policy(),
        args.config.key_refresh_interval(),
    ));
    let issuer = TokenIssuer::new(
        ring,
        args.config.issuer(),
        args.config.audience(),
        args.config.access_ttl(),
        args.config.refresh_ttl(),
    );

    let now = Utc::now();
    match args.operation {
        KeyOperation::Rotate => {
            let kid = issuer.rotate_signing_key(now).await?;
            println!("{kid}");
        }
        KeyOperation::Prune => {
            let pruned = issuer.prune_keys(now).await?;
            info!(pruned, "prune finished");
            println!("{pruned}");
        }
    }

    pool.close().await;
    Ok(())
}
