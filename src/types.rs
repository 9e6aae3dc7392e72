use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid client request: {0}")]
    InvalidRequest(String),

    #[error("Bad upstream payload: {0}")]
    BadUpstreamPayload(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            ShimError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "bad_request",
            ),
            ShimError::BadUpstreamPayload(m) => (
                axum::http::StatusCode::BAD_GATEWAY,
                m.clone(),
                "bad_upstream_json",
            ),
            ShimError::Upstream(s, m) => (*s, m.clone(), "upstream_error"),
            ShimError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "network_error",
            ),
            ShimError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "serialization_error",
            ),
            ShimError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "io_error",
            ),
            ShimError::Config(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "config_error",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": code,
                "message": msg,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ShimError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ShimError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Developer,
}

impl Role {
    pub fn of_message(message: &serde_json::Value) -> Option<Role> {
        message
            .get("role")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
    }
}

/// Text of a chat message, whether `content` is a plain string or an array of parts.
pub fn message_text(message: &serde_json::Value) -> String {
    match message.get("content") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// --- PROVIDER WIRE TYPES ---

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct PulseDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ProviderToolCallDelta>>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PulseDelta {
    pub fn extract_reasoning(&self) -> Option<String> {
        let val = self
            .extra
            .get("reasoning_content")
            .or_else(|| self.extra.get("reasoning"))
            .or_else(|| self.extra.get("thought"))?;
        match val.as_str() {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => None,
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderPulseChoice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub delta: PulseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Treats an explicit `null` like an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(serde::Deserialize, Debug)]
pub enum LineEvent {
    Pulse(ProviderPulse),
    Error(ProviderError),
    Unknown(String),
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderPulse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ProviderPulseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<RawFunction>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct RawFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,

    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn parse_provider_line(data: &str) -> LineEvent {
    // Try Error first as it's more specific (requires "error" key)
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(pulse) = serde_json::from_str::<ProviderPulse>(data) {
        if !pulse.choices.is_empty() || pulse.usage.is_some() {
            return LineEvent::Pulse(pulse);
        }
    }
    tracing::debug!(
        "[STREAM] Unknown line format: {}",
        crate::str_utils::first_n_chars_lossy(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}
