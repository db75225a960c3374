//! API surface tests: authentication, health, model listing and request
//! validation. None of these reach a proxy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, StatusCode};
use tower::ServiceExt;

use proxyrelay::api::{create_router, AppState, REQUEST_ID_HEADER};
use proxyrelay::config::{ApiKey, Config};
use proxyrelay::models::ModelCatalog;
use proxyrelay::pool::{CandidateSource, Pool, PoolOptions, Probe, ProxyPool, SourceError};

/// Fixed model list, every entry accessible.
struct StaticModels(Vec<&'static str>);

#[async_trait]
impl CandidateSource<String> for StaticModels {
    async fn fetch_candidates(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.0.iter().map(|m| m.to_string()).collect())
    }
}

struct Accessible;

#[async_trait]
impl Probe<String> for Accessible {
    async fn check(&self, _candidate: &String) -> bool {
        true
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    // Nothing listens here; these tests never need a proxy.
    config.pool.source_url = "/nonexistent/proxyrelay-proxies.txt".to_string();
    config.models.enabled = false;
    config
}

fn state_with(config: Config) -> AppState {
    let pool = Arc::new(ProxyPool::from_config(&config).unwrap());
    AppState::new(config, pool).unwrap()
}

async fn with_catalog(mut state: AppState, models: Vec<&'static str>) -> AppState {
    let pool = Arc::new(Pool::new(
        Arc::new(StaticModels(models)),
        Arc::new(Accessible),
        PoolOptions {
            label: "model",
            keep_on_empty: true,
            ..PoolOptions::default()
        },
    ));
    pool.refresh().await.unwrap();
    state.models = Arc::new(ModelCatalog::from_pool(pool, true, Duration::from_secs(5)));
    state
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_key(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", key))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn parse_body(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or_default())
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_pools() {
    let app = create_router(state_with(base_config()));

    let (status, json) = parse_body(app.oneshot(get("/health")).await.unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "proxyrelay");
    assert_eq!(json["proxies"]["available"], 0);
    assert_eq!(json["proxies"]["evictions"], 0);
    assert_eq!(json["proxies"]["refreshes"], 0);
    assert_eq!(json["proxies"]["refresh_failures"], 0);
    assert!(json["proxies"]["last_refresh"].is_null());
    assert_eq!(json["models"]["enabled"], false);
    assert_eq!(json["auth"], false);
}

#[tokio::test]
async fn test_health_open_when_key_configured() {
    let mut config = base_config();
    config.server.api_key = Some(ApiKey::from("sk-relay"));
    let app = create_router(state_with(config));

    let (status, json) = parse_body(app.oneshot(get("/health")).await.unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["auth"], true);
}

#[tokio::test]
async fn test_every_response_carries_request_id() {
    let app = create_router(state_with(base_config()));

    let response = app.oneshot(get("/health")).await.unwrap();

    let id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .expect("request id header")
        .to_str()
        .unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok(), "not a uuid: {}", id);
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_key_rejected() {
    let mut config = base_config();
    config.server.api_key = Some(ApiKey::from("sk-relay"));
    let app = create_router(state_with(config));

    let response = app.oneshot(get("/v1/models")).await.unwrap();
    assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
    let (status, json) = parse_body(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "invalid_api_key");
    assert_eq!(json["error"]["message"], "Missing API key");
}

#[tokio::test]
async fn test_wrong_key_rejected() {
    let mut config = base_config();
    config.server.api_key = Some(ApiKey::from("sk-relay"));
    let app = create_router(state_with(config));

    let (status, json) =
        parse_body(app.oneshot(get_with_key("/v1/models", "sk-other")).await.unwrap()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["message"], "Invalid API key");
}

#[tokio::test]
async fn test_non_bearer_header_rejected() {
    let mut config = base_config();
    config.server.api_key = Some(ApiKey::from("sk-relay"));
    let app = create_router(state_with(config));

    let request = Request::builder()
        .uri("/models")
        .header("authorization", "Basic c2stcmVsYXk=")
        .body(Body::empty())
        .unwrap();
    let (status, json) = parse_body(app.oneshot(request).await.unwrap()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["message"], "Invalid API key format");
}

#[tokio::test]
async fn test_correct_key_accepted() {
    let mut config = base_config();
    config.server.api_key = Some(ApiKey::from("sk-relay"));
    let app = create_router(state_with(config));

    let (status, json) =
        parse_body(app.oneshot(get_with_key("/v1/models", "sk-relay")).await.unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["object"], "list");
}

// ============================================================================
// Model listing and validation
// ============================================================================

#[tokio::test]
async fn test_models_listed_sorted_on_both_paths() {
    let state = with_catalog(
        state_with(base_config()),
        vec!["mistralai/Mixtral-8x7B-Instruct-v0.1", "meta-llama/Meta-Llama-3-8B-Instruct"],
    )
    .await;
    let app = create_router(state);

    for uri in ["/v1/models", "/models"] {
        let (status, json) = parse_body(app.clone().oneshot(get(uri)).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec!["meta-llama/Meta-Llama-3-8B-Instruct", "mistralai/Mixtral-8x7B-Instruct-v0.1"]
        );
        assert_eq!(json["data"][0]["owned_by"], "deepinfra");
    }
}

#[tokio::test]
async fn test_unknown_model_rejected_before_dispatch() {
    let state = with_catalog(state_with(base_config()), vec!["meta-llama/Meta-Llama-3-8B-Instruct"]).await;
    let app = create_router(state);

    let body = r#"{"model":"openai/gpt-4","messages":[{"role":"user","content":"hi"}]}"#;
    let (status, json) =
        parse_body(app.oneshot(post_json("/v1/chat/completions", body)).await.unwrap()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "model_not_found");
    assert!(json["error"]["message"].as_str().unwrap().contains("openai/gpt-4"));
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let app = create_router(state_with(base_config()));

    let (status, json) = parse_body(
        app.oneshot(post_json("/v1/chat/completions", "{not json"))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_empty_messages_is_400() {
    let app = create_router(state_with(base_config()));

    let body = r#"{"model":"meta-llama/Meta-Llama-3-8B-Instruct","messages":[]}"#;
    let (status, json) =
        parse_body(app.oneshot(post_json("/v1/chat/completions", body)).await.unwrap()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_no_proxies_is_502_after_attempts() {
    let mut config = base_config();
    config.dispatch.chat.max_attempts = 3;
    config.pool.empty_backoff_ms = 10;
    let app = create_router(state_with(config));

    let body = r#"{"model":"meta-llama/Meta-Llama-3-8B-Instruct","messages":[{"role":"user","content":"hi"}]}"#;
    let (status, json) =
        parse_body(app.oneshot(post_json("/v1/chat/completions", body)).await.unwrap()).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["code"], "dispatch_exhausted");
    assert_eq!(
        json["error"]["message"],
        "Upstream request failed after 3 attempts: no proxies available"
    );
}
