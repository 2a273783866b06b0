//! The `axum` router implementing the public route table over the core engine.

use axum::{
    Json, Router,
    extract::{Request, State},
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    batch::BatchCoordinator,
    prelude::*,
    state::AppState,
    types::{ChatRequest, chat_requests_from_array},
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/batch/chat/completions", post(batch_chat_completions))
        .route("/v1/models", get(list_models))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            tracing::info_span!(
                "http_request",
                request_id = %Uuid::new_v4(),
                method = %request.method(),
                path = %request.uri().path(),
            )
        }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `POST /v1/chat/completions`: `Dispatcher.handle(ChatRequest) -> ChatResponse`.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let request = ChatRequest::from_value(body)?;
    let response = state.dispatcher.handle(request).await?;
    Ok(Json(response.into_json()))
}

/// `POST /v1/batch/chat/completions`: `BatchCoordinator.handle(list, wait_for_all)`.
///
/// Body shape: `{"requests": [ChatRequest, ...], "wait_for_all": bool}`,
/// `wait_for_all` defaulting to `true`.
async fn batch_chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let object = body
        .as_object()
        .ok_or_else(|| ConductorError::BadRequest("batch body must be a JSON object".into()))?;
    let requests_value = object
        .get("requests")
        .cloned()
        .ok_or_else(|| ConductorError::BadRequest("requests is required".into()))?;
    let wait_for_all = object
        .get("wait_for_all")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let requests = chat_requests_from_array(requests_value)?;
    let outcome = BatchCoordinator::new(&state.dispatcher)
        .handle(requests, wait_for_all)
        .await;
    Ok(Json(
        serde_json::to_value(outcome).expect("BatchOutcome always serializes"),
    ))
}

/// `GET /v1/models`: unified model names plus the built-in default.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "models": state.dispatcher.model_names() }))
}

/// `GET /status`: `Ledger.snapshot()` per key.
async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let keys = state.dispatcher.ledger_snapshot();
    Json(json!({ "keys": keys }))
}

/// `GET /health`: constant liveness payload.
async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "trainforge-conductor" }))
}
