//! The internal, normalized chat request/response data model.

use serde::de::Error as _;

use crate::prelude::*;

/// Maximum number of unknown top-level fields we will carry through on a
/// request, so a client cannot force us to buffer an unbounded extension map.
const MAX_EXTENSION_FIELDS: usize = 32;

/// One message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// The role a [`Message`] was authored under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A normalized inbound chat-completions request.
///
/// This is deserialized directly from the wire via [`ChatRequest::from_value`]
/// rather than `#[derive(Deserialize)]`, because defaults and range validation
/// need to happen together (a `max_tokens: 0` should fail validation, not
/// silently become the default).
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stop: Option<Vec<String>>,
    pub forced_provider: Option<String>,
    /// Unknown fields carried through unchanged, bounded to
    /// [`MAX_EXTENSION_FIELDS`].
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, Value>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            model: "llama-70b".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            stop: None,
            forced_provider: None,
            extensions: serde_json::Map::new(),
        }
    }
}

/// The well-known top-level fields of a chat request. Anything else is an
/// extension field.
const KNOWN_FIELDS: &[&str] = &[
    "messages",
    "model",
    "temperature",
    "max_tokens",
    "top_p",
    "stop",
    "provider",
];

impl ChatRequest {
    /// Parse and validate a request body, applying defaults and rejecting
    /// out-of-range values as a `BadRequest`.
    pub fn from_value(mut value: Value) -> Result<Self, ConductorError> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| ConductorError::BadRequest("body must be a JSON object".into()))?;

        let mut request = ChatRequest::default();

        if let Some(messages) = object.remove("messages") {
            let messages: Vec<Message> = serde_json::from_value(messages)
                .map_err(|e| ConductorError::BadRequest(format!("messages: {e}")))?;
            if messages.is_empty() {
                return Err(ConductorError::BadRequest(
                    "messages must not be empty".into(),
                ));
            }
            request.messages = messages;
        } else {
            return Err(ConductorError::BadRequest("messages is required".into()));
        }

        if let Some(model) = object.remove("model") {
            request.model = serde_json::from_value(model)
                .map_err(|e| ConductorError::BadRequest(format!("model: {e}")))?;
        }

        if let Some(temperature) = object.remove("temperature") {
            let temperature: f32 = serde_json::from_value(temperature)
                .map_err(|e| ConductorError::BadRequest(format!("temperature: {e}")))?;
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConductorError::BadRequest(
                    "temperature must be within [0, 2]".into(),
                ));
            }
            request.temperature = temperature;
        }

        if let Some(max_tokens) = object.remove("max_tokens") {
            let max_tokens: u32 = serde_json::from_value(max_tokens)
                .map_err(|e| ConductorError::BadRequest(format!("max_tokens: {e}")))?;
            if max_tokens == 0 {
                return Err(ConductorError::BadRequest(
                    "max_tokens must be positive".into(),
                ));
            }
            request.max_tokens = max_tokens;
        }

        if let Some(top_p) = object.remove("top_p") {
            let top_p: f32 = serde_json::from_value(top_p)
                .map_err(|e| ConductorError::BadRequest(format!("top_p: {e}")))?;
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(ConductorError::BadRequest(
                    "top_p must be within (0, 1]".into(),
                ));
            }
            request.top_p = top_p;
        }

        if let Some(stop) = object.remove("stop") {
            let stop: Vec<String> = serde_json::from_value(stop)
                .map_err(|e| ConductorError::BadRequest(format!("stop: {e}")))?;
            request.stop = Some(stop);
        }

        if let Some(provider) = object.remove("provider") {
            let provider: String = serde_json::from_value(provider)
                .map_err(|e| ConductorError::BadRequest(format!("provider: {e}")))?;
            request.forced_provider = Some(provider);
        }

        if object.len() > MAX_EXTENSION_FIELDS {
            return Err(ConductorError::BadRequest(format!(
                "too many unknown fields: {} (max {})",
                object.len(),
                MAX_EXTENSION_FIELDS
            )));
        }
        request.extensions = std::mem::take(object);

        Ok(request)
    }

    /// Approximate character length of all message contents, used by the
    /// ledger's token-estimation policy.
    pub fn content_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    /// Are there any fields we don't recognize, beyond the documented ones?
    pub fn known_fields() -> &'static [&'static str] {
        KNOWN_FIELDS
    }
}

/// Token usage reported by (or inferred for) a provider response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// An OpenAI-shaped response, augmented with who actually served it.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The provider's raw JSON body, `choices` and all.
    pub body: Value,
    pub provider: String,
    pub provider_key_name: String,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Render this response as the JSON the client receives: the provider's
    /// body plus the two extension fields.
    pub fn into_json(mut self) -> Value {
        if let Some(object) = self.body.as_object_mut() {
            object.insert("provider".to_string(), json!(self.provider));
            object.insert(
                "provider_key_name".to_string(),
                json!(self.provider_key_name),
            );
        }
        self.body
    }
}

/// Deserialize helper used by the batch route, where each element of the
/// input array must independently validate as a [`ChatRequest`].
pub fn chat_requests_from_array(value: Value) -> Result<Vec<ChatRequest>, ConductorError> {
    let array = value
        .as_array()
        .cloned()
        .ok_or_else(|| serde_json::Error::custom("batch body must be a JSON array"))
        .map_err(|e| ConductorError::BadRequest(e.to_string()))?;
    array.into_iter().map(ChatRequest::from_value).collect()
}
