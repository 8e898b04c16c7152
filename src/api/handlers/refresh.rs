use crate::service::AuthService;
use crate::token::TokenPair;
use axum::{
    Json,
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, HeaderValue, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use utoipa::ToSchema;

use super::error::{ApiError, ErrorBody};
use super::request::request_signals;

#[derive(ToSchema, Deserialize, Debug)]
pub struct RefreshRequest {
    refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// When the refresh token, and with it the session, expires.
    pub expires_at: DateTime<Utc>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type.to_string(),
            expires_in: pair.expires_in,
            expires_at: pair.expires_at,
        }
    }
}

#[utoipa::path(
    post,
    path= "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses (
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 401, description = "Invalid, expired, revoked or replayed refresh token", body = ErrorBody),
        (status = 429, description = "Too many refresh attempts", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody),
    ),
    tag= "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    service: Extension<Arc<AuthService>>,
    Json(payload): Json<RefreshRequest>,
) -> Response {
    let signals = request_signals(&headers, peer.map(|ConnectInfo(addr)| addr.ip()));
    match service
        .refresh(payload.refresh_token.trim(), &signals, Utc::now())
        .await
    {
        Ok(pair) => (
            [(CACHE_CONTROL, HeaderValue::from_static("no-store"))],
            Json(TokenResponse::from(pair)),
        )
            .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
