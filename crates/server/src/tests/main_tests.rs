use super::*;
use axum::{body, body::Body, http::Request};
use relay_core::{RelayOptions, WriterConfig};
use session_auth::{mint_token, TokenConfig};
use shared::domain::UserId;
use std::time::Duration;
use tower::ServiceExt;

pub(crate) async fn test_state() -> AppState {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let relay = Relay::new(
        Arc::new(storage.clone()),
        ConnectionRegistry::new(),
        RelayOptions::default(),
    );
    AppState {
        storage,
        relay,
        tokens: TokenConfig {
            secret: "test-secret".to_string(),
            ttl_seconds: 60,
        },
        writer: WriterConfig {
            ping_interval: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(5),
            queue_capacity: 16,
        },
    }
}

async fn error_body(response: axum::response::Response) -> ApiError {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("api error json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = build_router(Arc::new(test_state().await));
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn healthz_reports_unavailable_when_storage_is_closed() {
    let state = test_state().await;
    state.storage.pool().close().await;
    let app = build_router(Arc::new(state));

    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_body(response).await.code, ErrorCode::Unavailable);
}

#[tokio::test]
async fn ws_without_token_is_unauthorized() {
    let app = build_router(Arc::new(test_state().await));
    let request = Request::get("/ws").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_body(response).await.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn ws_with_foreign_token_is_unauthorized() {
    let app = build_router(Arc::new(test_state().await));
    let foreign = mint_token(
        &TokenConfig {
            secret: "someone-else".to_string(),
            ttl_seconds: 60,
        },
        UserId(1),
    )
    .expect("token");

    let request = Request::get(format!("/ws?token={foreign}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ws_with_valid_token_still_requires_an_upgrade() {
    let state = test_state().await;
    let token = mint_token(&state.tokens, UserId(1)).expect("token");
    let app = build_router(Arc::new(state));

    let request = Request::get(format!("/ws?token={token}"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.status().is_client_error());
}
