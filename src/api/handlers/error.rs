//! Render [`AuthError`] as an HTTP response.
//!
//! Every credential failure collapses into one 401 body, so a detected
//! refresh-token replay reads exactly like an expired token.

use axum::{
    Json,
    http::{
        HeaderValue, StatusCode,
        header::{RETRY_AFTER, WWW_AUTHENTICATE},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::error::AuthError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    error: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unlock_at: Option<DateTime<Utc>>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ErrorBody {
    const fn new(error: &'static str, message: &'static str) -> Self {
        Self {
            error,
            message,
            unlock_at: None,
            retry_after: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            AuthError::AccountLocked { unlock_at } => (
                StatusCode::LOCKED,
                Json(ErrorBody {
                    unlock_at: Some(unlock_at),
                    ..ErrorBody::new("account_locked", "Too many failed attempts, try again later")
                }),
            )
                .into_response(),
            AuthError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(RETRY_AFTER, HeaderValue::from(retry_after_seconds))],
                Json(ErrorBody {
                    retry_after: Some(retry_after_seconds),
                    ..ErrorBody::new("rate_limited", "Too many requests")
                }),
            )
                .into_response(),
            AuthError::VerificationUnavailable(reason) => {
                error!("Verification unavailable: {reason}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody::new(
                        "verification_unavailable",
                        "Authentication is temporarily unavailable",
                    )),
                )
                    .into_response()
            }
            other => {
                debug!(kind = other.kind(), "credentials rejected");
                (
                    StatusCode::UNAUTHORIZED,
                    [(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))],
                    Json(ErrorBody::new(
                        "invalid_credentials",
                        "Invalid or expired credentials",
                    )),
                )
                    .into_response()
            }
        }
    }
}
