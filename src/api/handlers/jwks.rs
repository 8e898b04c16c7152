use crate::service::AuthService;
use crate::token::Jwks;
use axum::{
    Json,
    extract::Extension,
    http::{HeaderValue, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

use super::error::{ApiError, ErrorBody};

/// Relying parties may cache the key set for an hour.
const JWKS_CACHE_CONTROL: &str = "public, max-age=3600";

#[utoipa::path(
    get,
    path= "/.well-known/jwks.json",
    responses (
        (status = 200, description = "Active and retiring verification keys", body = Jwks),
        (status = 503, description = "Signing keys could not be loaded", body = ErrorBody),
    ),
    tag= "jwks"
)]
pub async fn jwks(service: Extension<Arc<AuthService>>) -> Response {
    match service.publish_key_set(Utc::now()).await {
        Ok(jwks) => (
            [(CACHE_CONTROL, HeaderValue::from_static(JWKS_CACHE_CONTROL))],
            Json(jwks),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to publish key set: {err}");
            ApiError(err).into_response()
        }
    }
}
