use crate::GIT_COMMIT_HASH;
use crate::service::AuthService;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::{Instrument, error, info_span};
use utoipa::ToSchema;

/// Outcome of one dependency check.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    Ok,
    Error,
    /// No database configured, stores live in process memory.
    Memory,
}

impl Check {
    const fn is_healthy(self) -> bool {
        !matches!(self, Self::Error)
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: Check,
    signing_key: Check,
    /// Key id new tokens are signed with.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Store and signing key are usable", body = Health),
        (status = 503, description = "Store or signing key is unavailable", body = Health)
    ),
    tag= "health"
)]
pub async fn health(
    method: Method,
    service: Extension<Arc<AuthService>>,
    pool: Option<Extension<PgPool>>,
) -> impl IntoResponse {
    let database = match pool {
        Some(Extension(pool)) => ping(&pool).await,
        None => Check::Memory,
    };

    let (signing_key, kid) = match service.issuer().key_ring().signing_key().await {
        Ok(key) => (Check::Ok, Some(key.kid.clone())),
        Err(err) => {
            error!("No usable signing key: {err}");
            (Check::Error, None)
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        signing_key,
        kid,
    };

    let status = if database.is_healthy() && signing_key.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let mut headers = HeaderMap::new();
    if let Some(value) = x_app(&health) {
        headers.insert(HeaderName::from_static("x-app"), value);
    }

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    (status, headers, body)
}

/// `name:version:short-commit`, the short commit left empty when unknown.
fn x_app(health: &Health) -> Option<HeaderValue> {
    let short_hash = health.commit.get(..7).filter(|_| health.commit.len() > 7);
    HeaderValue::from_str(&format!(
        "{}:{}:{}",
        health.name,
        health.version,
        short_hash.unwrap_or_default()
    ))
    .ok()
}

async fn ping(pool: &PgPool) -> Check {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let mut conn = match pool.acquire().instrument(acquire_span).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("Failed to acquire database connection: {err}");
            return Check::Error;
        }
    };

    let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
    match conn.ping().instrument(ping_span).await {
        Ok(()) => Check::Ok,
        Err(err) => {
            error!("Failed to ping database: {err}");
            Check::Error
        }
    }
}
