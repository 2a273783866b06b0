//! End-to-end coverage of the HTTP surface against a mocked upstream:
//! successful dispatch, model-name translation, 429 failover, capacity
//! timeouts, and batch fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use trainforge_conductor::{
    config::{Config, KeyDescriptor, ProviderDescriptor, RawConductorConfig},
    registry::ModelRegistry,
    routes::router,
    state::AppState,
};

fn config_with_provider(base_url: &str, rpm: u32, tpm: u32) -> Config {
    let provider = Arc::new(ProviderDescriptor {
        id: "cerebras".to_string(),
        base_url: base_url.to_string(),
        chat_path: "/chat/completions".to_string(),
        enabled: true,
    });
    let keys = vec![Arc::new(KeyDescriptor {
        provider: provider.clone(),
        name: "k1".to_string(),
        api_key: "secret".to_string(),
        requests_per_minute: rpm,
        tokens_per_minute: tpm,
    })];
    Config {
        conductor: RawConductorConfig::default(),
        server: Default::default(),
        providers: vec![provider],
        keys,
        models: ModelRegistry::new(&HashMap::new()),
    }
}

async fn send(app: axum::Router, uri: &str, method: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_reports_healthy() {
    let config = config_with_provider("http://127.0.0.1:1", 10, 1000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, body) = send(app, "/health", "GET", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
}

#[tokio::test]
async fn chat_completions_succeeds_against_mocked_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
        })))
        .mount(&server)
        .await;

    let config = config_with_provider(&server.uri(), 10, 1000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, body) = send(
        app,
        "/v1/chat/completions",
        "POST",
        json!({"messages": [{"role": "user", "content": "hello"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], json!("cerebras"));
    assert_eq!(body["provider_key_name"], json!("k1"));
    assert_eq!(body["choices"][0]["message"]["content"], json!("hi there"));
}

/// Unified-name translation: `llama-70b` resolves to the
/// cerebras-native `llama-3.3-70b` in the outbound body.
#[tokio::test]
async fn translates_unified_model_name_for_cerebras() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(wiremock::matchers::body_partial_json(
            json!({"model": "llama-3.3-70b"}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
        })))
        .mount(&server)
        .await;

    let config = config_with_provider(&server.uri(), 10, 1000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, _body) = send(
        app,
        "/v1/chat/completions",
        "POST",
        json!({"messages": [{"role": "user", "content": "hello"}], "model": "llama-70b"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn no_providers_configured_yields_503() {
    let config = Config {
        conductor: RawConductorConfig::default(),
        server: Default::default(),
        providers: Vec::new(),
        keys: Vec::new(),
        models: ModelRegistry::new(&HashMap::new()),
    };
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, body) = send(
        app,
        "/v1/chat/completions",
        "POST",
        json!({"messages": [{"role": "user", "content": "hello"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("No providers"));
}

/// Capacity timeout: a single key at RPM=1 serves one request,
/// then a second back-to-back request must wait past `request_timeout` and
/// come back 504 with the specified detail message.
#[tokio::test]
async fn capacity_timeout_yields_504() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
        })))
        .mount(&server)
        .await;

    let mut config = config_with_provider(&server.uri(), 1, 1000);
    config.conductor.request_timeout = 1;
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let body = json!({"messages": [{"role": "user", "content": "hello"}]});

    let (first_status, _) = send(app.clone(), "/v1/chat/completions", "POST", body.clone()).await;
    assert_eq!(first_status, StatusCode::OK);

    let (second_status, second_body) =
        send(app, "/v1/chat/completions", "POST", body).await;
    assert_eq!(second_status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        second_body["detail"],
        json!("Request timed out waiting for available capacity")
    );
}

/// Forced provider: requesting a provider that isn't configured
/// at all yields 503, not 504: the candidate list was empty, so the request
/// never entered the capacity-wait loop.
#[tokio::test]
async fn forced_provider_with_no_matching_keys_yields_503() {
    let config = config_with_provider("http://127.0.0.1:1", 10, 1000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, body) = send(
        app,
        "/v1/chat/completions",
        "POST",
        json!({
            "messages": [{"role": "user", "content": "hello"}],
            "provider": "nvidia",
        }),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("No providers"));
}

#[tokio::test]
async fn invalid_body_yields_422() {
    let config = config_with_provider("http://127.0.0.1:1", 10, 1000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, _body) = send(app, "/v1/chat/completions", "POST", json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

/// Failover on 429: key-A is penalized and the request succeeds
/// on key-B.
#[tokio::test]
async fn fails_over_to_second_key_on_429() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let provider = Arc::new(ProviderDescriptor {
        id: "cerebras".to_string(),
        base_url: server.uri(),
        chat_path: "/chat/completions".to_string(),
        enabled: true,
    });
    let keys = vec![
        Arc::new(KeyDescriptor {
            provider: provider.clone(),
            name: "key-a".to_string(),
            api_key: "secret-a".to_string(),
            requests_per_minute: 10,
            tokens_per_minute: 1000,
        }),
        Arc::new(KeyDescriptor {
            provider: provider.clone(),
            name: "key-b".to_string(),
            api_key: "secret-b".to_string(),
            requests_per_minute: 10,
            tokens_per_minute: 1000,
        }),
    ];
    let config = Config {
        conductor: RawConductorConfig {
            scheduling_strategy: trainforge_conductor::selector::Strategy::Sequential,
            ..RawConductorConfig::default()
        },
        server: Default::default(),
        providers: vec![provider],
        keys,
        models: ModelRegistry::new(&HashMap::new()),
    };
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let (status, body) = send(
        app,
        "/v1/chat/completions",
        "POST",
        json!({"messages": [{"role": "user", "content": "hello"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider_key_name"], json!("key-b"));
}

/// Batch fan-out: all requests complete and order is preserved.
#[tokio::test]
async fn batch_preserves_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
        })))
        .mount(&server)
        .await;

    let config = config_with_provider(&server.uri(), 30, 10000);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let requests: Vec<Value> = (0..6)
        .map(|i| json!({"messages": [{"role": "user", "content": format!("msg {i}")}]}))
        .collect();
    let (status, body) = send(
        app,
        "/v1/batch/chat/completions",
        "POST",
        json!({"requests": requests}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let responses = body["responses"].as_array().unwrap();
    assert_eq!(responses.len(), 6);
    assert!(responses.iter().all(|r| !r.is_null()));
    assert!(body["failed"].as_array().unwrap().is_empty());
}
