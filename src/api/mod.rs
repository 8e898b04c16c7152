use crate::api::handlers::health;
use crate::service::AuthService;
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::options,
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// The full application: documented routes, Swagger UI and middleware.
///
/// Without a `pool` the health check reports the in-memory store.
pub fn app(service: Arc<AuthService>, pool: Option<PgPool>) -> Router {
    let (router, openapi) = router().split_for_parts();
    let mut app = router
        .route("/health", options(health::health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(service)),
        );

    if let Some(pool) = pool {
        app = app.layer(Extension(pool));
    }
    app
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, service: Arc<AuthService>, pool: Option<PgPool>) -> Result<()> {
    let app = app(service, pool);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::guard::{RateLimit, RateLimitPolicy};
    use crate::risk::RequestSignals;
    use crate::service::{CoreStores, LoginRequest};
    use crate::session::store::FaultySessionStore;
    use crate::store::StorePolicy;
    use crate::token::MemoryKeyStore;
    use crate::token::keys::{KeyStatus, test_record};
    use axum::body::to_bytes;
    use axum::extract::ConnectInfo;
    use axum::http::{
        StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    };
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    async fn service() -> anyhow::Result<Arc<AuthService>> {
        let keys = Arc::new(MemoryKeyStore::new());
        keys.insert(test_record("k1", KeyStatus::Active, Utc::now())).await;
        let stores = CoreStores {
            keys,
            ..CoreStores::memory()
        };
        Ok(Arc::new(AuthService::new(CoreConfig::new(), stores, None)))
    }

    async fn login(service: &AuthService) -> anyhow::Result<(String, String)> {
        let outcome = service
            .mint_session_and_tokens(
                LoginRequest {
                    user_id: "u1".to_string(),
                    request: RequestSignals {
                        user_agent: "curl/8.5.0".to_string(),
                        ..RequestSignals::default()
                    },
                    ..LoginRequest::default()
                },
                Utc::now(),
            )
            .await?;
        Ok((outcome.tokens.access_token, outcome.tokens.refresh_token))
    }

    fn refresh_request(token: &str) -> anyhow::Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri("/v1/auth/refresh")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(
                &serde_json::json!({ "refresh_token": token }),
            )?))?)
    }

    async fn json(response: axum::response::Response) -> anyhow::Result<serde_json::Value> {
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    #[tokio::test]
    async fn health_reports_memory_store() -> anyhow::Result<()> {
        let app = app(service().await?, None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-app"));
        assert!(response.headers().contains_key("x-request-id"));
        let body = json(response).await?;
        assert_eq!(body["database"], "memory");
        assert_eq!(body["signing_key"], "ok");
        Ok(())
    }

    #[tokio::test]
    async fn jwks_is_cacheable() -> anyhow::Result<()> {
        let app = app(service().await?, None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/jwks.json")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
            Some("public, max-age=3600")
        );
        let body = json(response).await?;
        assert_eq!(body["keys"][0]["kid"], "k1");
        assert_eq!(body["keys"][0]["key_ops"][0], "verify");
        Ok(())
    }

    #[tokio::test]
    async fn replayed_refresh_looks_like_any_other_failure() -> anyhow::Result<()> {
        let service = service().await?;
        let (_, refresh) = login(&service).await?;
        let app = app(service.clone(), None);

        let response = app.clone().oneshot(refresh_request(&refresh)?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let rotated = json(response).await?;
        assert_ne!(rotated["refresh_token"], refresh.as_str());
        let access = rotated["access_token"].as_str().unwrap_or_default().to_string();

        let replay = app.clone().oneshot(refresh_request(&refresh)?).await?;
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
        let replay = json(replay).await?;

        let garbage = app.clone().oneshot(refresh_request("not-a-token")?).await?;
        assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(replay, json(garbage).await?);

        // The replay revoked every session of the user.
        let revoked = service.authenticate(&access, Utc::now()).await;
        assert!(revoked.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stalled_session_store_answers_503() -> anyhow::Result<()> {
        let keys = Arc::new(MemoryKeyStore::new());
        keys.insert(test_record("k1", KeyStatus::Active, Utc::now())).await;
        let sessions = Arc::new(FaultySessionStore::default());
        let stores = CoreStores {
            keys,
            sessions: sessions.clone(),
            ..CoreStores::memory()
        };
        let config = CoreConfig::new().with_store_policy(StorePolicy::new(
            std::time::Duration::from_millis(20),
            std::time::Duration::from_millis(5),
        ));
        let service = Arc::new(AuthService::new(config, stores, None));
        let (_, refresh) = login(&service).await?;
        let app = app(service, None);

        sessions.stall_reads.store(true, Ordering::SeqCst);
        let response = app.oneshot(refresh_request(&refresh)?).await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_for_does_not_split_the_refresh_limit() -> anyhow::Result<()> {
        let keys = Arc::new(MemoryKeyStore::new());
        keys.insert(test_record("k1", KeyStatus::Active, Utc::now())).await;
        let config = CoreConfig::new().with_rate_limits(RateLimitPolicy {
            refresh: RateLimit::new(1, 60),
            ..RateLimitPolicy::default()
        });
        let stores = CoreStores {
            keys,
            ..CoreStores::memory()
        };
        let app = app(Arc::new(AuthService::new(config, stores, None)), None);
        let peer = SocketAddr::from(([192, 0, 2, 44], 50_000));

        for (forwarded, status) in [
            ("203.0.113.1", StatusCode::UNAUTHORIZED),
            ("203.0.113.2", StatusCode::TOO_MANY_REQUESTS),
        ] {
            let mut request = refresh_request("not-a-token")?;
            request
                .headers_mut()
                .insert("x-forwarded-for", HeaderValue::from_static(forwarded));
            request.extensions_mut().insert(ConnectInfo(peer));
            let response = app.clone().oneshot(request).await?;
            assert_eq!(response.status(), status);
        }
        Ok(())
    }
}
