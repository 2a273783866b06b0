//! Fulfills one [`ChatRequest`] end-to-end: RESOLVE → SELECT → RESERVE
//! → TRANSLATE → CALL → INTERPRET → (DONE | ROTATE).

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::{
    config::{KeyDescriptor, RawConductorConfig},
    ledger::{Ledger, PenaltyReason},
    prelude::*,
    registry::{ModelRegistry, Resolution},
    selector::Selector,
    types::{ChatRequest, ChatResponse, Usage},
};

/// Cap on the http_5xx backoff escalation.
const MAX_5XX_BACKOFF: Duration = Duration::from_secs(60);
/// Starting point for the http_5xx backoff escalation.
const BASE_5XX_BACKOFF: Duration = Duration::from_secs(5);
/// Fallback cool-down when a 429 carries no `Retry-After` header.
const DEFAULT_429_BACKOFF: Duration = Duration::from_secs(30);
/// Cool-down applied after a network-level failure.
const NETWORK_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Fulfills chat requests against the configured providers.
pub struct Dispatcher {
    http: reqwest::Client,
    keys: Vec<Arc<KeyDescriptor>>,
    ledger: Arc<Ledger>,
    selector: Selector,
    models: Arc<ModelRegistry>,
    request_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    /// Tracks consecutive 5xx penalties per key, to escalate the cool-down
    /// (5s, exponential up to 60s on repeats). Reset whenever the
    /// key is next observed healthy (any non-5xx outcome).
    consecutive_5xx: Mutex<HashMap<(String, String), u32>>,
}

impl Dispatcher {
    pub fn new(
        keys: Vec<Arc<KeyDescriptor>>,
        ledger: Arc<Ledger>,
        models: Arc<ModelRegistry>,
        conductor: &RawConductorConfig,
    ) -> Self {
        for key in &keys {
            ledger.ensure_registered(key);
        }
        Self {
            http: reqwest::Client::new(),
            keys,
            ledger,
            selector: Selector::new(conductor.scheduling_strategy),
            models,
            request_timeout: Duration::from_secs(conductor.request_timeout),
            max_retries: conductor.max_retries,
            retry_delay: Duration::from_secs_f64(conductor.retry_delay),
            consecutive_5xx: Mutex::new(HashMap::new()),
        }
    }

    /// Are there any enabled provider/keys at all? Used to short-circuit with
    /// [`ConductorError::NoProviders`] before touching the Ledger.
    pub fn has_any_keys(&self) -> bool {
        self.keys.iter().any(|k| k.provider.enabled)
    }

    /// Total configured keys, used by the Batch Coordinator to size its
    /// concurrency ceiling (`total_keys × 2`).
    pub fn total_keys(&self) -> usize {
        self.keys.len()
    }

    /// Fulfill one request end-to-end.
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse> {
        if !self.has_any_keys() {
            return Err(ConductorError::NoProviders);
        }

        let estimated_tokens = estimate_tokens(&request);
        let deadline = Instant::now() + self.request_timeout;
        let mut last_error: Option<ConductorError> = None;
        let mut distinct_key_attempts: u32 = 0;

        loop {
            // SELECT: re-run every pass, time has passed and refills may
            // have happened.
            let candidates = self.selector.candidates(
                &self.keys,
                &self.ledger,
                &self.models,
                &request.model,
                request.forced_provider.as_deref(),
            );
            if candidates.is_empty() {
                return Err(last_error.unwrap_or(ConductorError::NoProviders));
            }

            // RESERVE: try every candidate once this pass.
            let reserved = candidates
                .iter()
                .find_map(|key| match self.ledger.try_reserve(key, estimated_tokens) {
                    Ok(reservation) => Some((key.clone(), reservation)),
                    Err(_) => None,
                });

            let (key, reservation) = match reserved {
                Some(pair) => pair,
                None => {
                    if Instant::now() >= deadline {
                        return Err(ConductorError::CapacityTimeout);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.ledger.wait_for_capacity(remaining);
                    continue;
                }
            };

            distinct_key_attempts += 1;
            if distinct_key_attempts > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }

            match self.attempt(&request, &key, reservation, estimated_tokens, deadline).await {
                AttemptOutcome::Done(response) => return Ok(response),
                AttemptOutcome::Rotate(error) => {
                    last_error = Some(error);
                    if distinct_key_attempts >= self.max_retries {
                        return Err(last_error.unwrap());
                    }
                }
                AttemptOutcome::Fatal(error) => return Err(error),
                AttemptOutcome::Timeout => return Err(ConductorError::CapacityTimeout),
            }
        }
    }

    /// TRANSLATE, CALL and INTERPRET for a single reserved key.
    async fn attempt(
        &self,
        request: &ChatRequest,
        key: &Arc<KeyDescriptor>,
        reservation: crate::ledger::Reservation,
        estimated_tokens: u32,
        deadline: Instant,
    ) -> AttemptOutcome {
        let native_model = match self.models.resolve(&request.model, &key.provider.id) {
            Resolution::Supported(model) => model,
            Resolution::NotSupported => {
                // The Selector already filters these out; this only happens
                // if config changed concurrently. Release, don't settle,
                // the call never left.
                self.ledger.release(key, reservation);
                return AttemptOutcome::Rotate(ConductorError::NoProviders);
            }
        };

        let body = translate(request, &native_model);
        let url = format!("{}{}", key.provider.base_url, key.provider.chat_path);
        let remaining = deadline.saturating_duration_since(Instant::now());

        let call = self
            .http
            .post(&url)
            .bearer_auth(&key.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = match tokio::time::timeout(remaining, call).await {
            Err(_elapsed) => {
                self.ledger.settle(key, reservation, estimated_tokens);
                return AttemptOutcome::Timeout;
            }
            Ok(Err(network_error)) => {
                self.ledger
                    .penalize(key, PenaltyReason::NetworkError, NETWORK_ERROR_BACKOFF);
                self.ledger.settle(key, reservation, estimated_tokens);
                self.reset_5xx_streak(key);
                return AttemptOutcome::Rotate(ConductorError::UpstreamServer(
                    network_error.to_string(),
                ));
            }
            Ok(Ok(response)) => response,
        };

        self.interpret(key, response, reservation, estimated_tokens)
            .await
    }

    async fn interpret(
        &self,
        key: &Arc<KeyDescriptor>,
        response: reqwest::Response,
        reservation: crate::ledger::Reservation,
        estimated_tokens: u32,
    ) -> AttemptOutcome {
        let status = response.status();

        if status.is_success() {
            self.reset_5xx_streak(key);
            return match response.json::<Value>().await {
                Ok(body) if body.get("choices").is_some() => {
                    let usage = body
                        .get("usage")
                        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
                    let actual_tokens =
                        usage.map(|u| u.total_tokens as u32).unwrap_or(estimated_tokens);
                    self.ledger.settle(key, reservation, actual_tokens);
                    AttemptOutcome::Done(ChatResponse {
                        body,
                        provider: key.provider.id.clone(),
                        provider_key_name: key.name.clone(),
                        usage,
                    })
                }
                _ => {
                    self.ledger.settle(key, reservation, estimated_tokens);
                    AttemptOutcome::Rotate(ConductorError::UpstreamServer(
                        "upstream returned a 2xx with no parseable `choices`".to_string(),
                    ))
                }
            };
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers()).unwrap_or(DEFAULT_429_BACKOFF);
            let message = response.text().await.unwrap_or_default();
            self.ledger.penalize(key, PenaltyReason::Http429, retry_after);
            // Do not refund, settle at the full estimate.
            self.ledger.settle(key, reservation, estimated_tokens);
            self.reset_5xx_streak(key);
            return AttemptOutcome::Rotate(ConductorError::UpstreamServer(message));
        }

        if status.is_server_error() {
            let backoff = self.escalate_5xx_backoff(key);
            let message = response.text().await.unwrap_or_default();
            self.ledger.penalize(key, PenaltyReason::Http5xx, backoff);
            self.ledger.settle(key, reservation, estimated_tokens);
            return AttemptOutcome::Rotate(ConductorError::UpstreamServer(message));
        }

        // Any other 4xx: client-fault. Don't penalize the key, and don't
        // rotate: the same request will fail identically elsewhere, so it
        // surfaces as an `UpstreamClient` error instead.
        self.reset_5xx_streak(key);
        let message = response.text().await.unwrap_or_default();
        self.ledger.settle(key, reservation, estimated_tokens);
        AttemptOutcome::Fatal(ConductorError::UpstreamClient { status, message })
    }

    fn escalate_5xx_backoff(&self, key: &KeyDescriptor) -> Duration {
        let id = (key.provider.id.clone(), key.name.clone());
        let mut streaks = self.consecutive_5xx.lock();
        let count = streaks.entry(id).or_insert(0);
        let backoff = BASE_5XX_BACKOFF
            .saturating_mul(1u32 << (*count).min(4))
            .min(MAX_5XX_BACKOFF);
        *count += 1;
        backoff
    }

    fn reset_5xx_streak(&self, key: &KeyDescriptor) {
        let id = (key.provider.id.clone(), key.name.clone());
        self.consecutive_5xx.lock().remove(&id);
    }

    /// Backs the `/status` route.
    pub fn ledger_snapshot(&self) -> Vec<crate::ledger::KeyStatus> {
        self.ledger.snapshot()
    }

    /// Backs `/v1/models`: every unified model name, falling back to the
    /// default `llama-70b` if the map happens to be empty.
    pub fn model_names(&self) -> Vec<String> {
        self.models.unified_names()
    }
}

/// The result of one TRANSLATE/CALL/INTERPRET pass.
enum AttemptOutcome {
    Done(ChatResponse),
    Rotate(ConductorError),
    Fatal(ConductorError),
    Timeout,
}

/// Pre-call token estimate: character length of all message contents
/// divided by 4, rounded up, plus `max_tokens`.
fn estimate_tokens(request: &ChatRequest) -> u32 {
    let chars = request.content_chars() as u32;
    chars.div_ceil(4) + request.max_tokens
}

/// TRANSLATE: rewrite the outbound body for the
/// OpenAI-compatible chat-completions dialect every supported provider
/// speaks. No per-provider branching, providers differ only in base URL,
/// key, and native model id, all supplied by config.
fn translate(request: &ChatRequest, native_model: &str) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(native_model));
    body.insert("messages".to_string(), json!(request.messages));
    body.insert("temperature".to_string(), json!(request.temperature));
    body.insert("max_tokens".to_string(), json!(request.max_tokens));
    body.insert("top_p".to_string(), json!(request.top_p));
    if let Some(stop) = &request.stop {
        body.insert("stop".to_string(), json!(stop));
    }
    for (field, value) in &request.extensions {
        body.entry(field.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(body)
}

/// Parse a `Retry-After` header as whole seconds.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
