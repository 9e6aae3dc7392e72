use crate::constants::LOG_BODY_MAX_CHARS;
use crate::fallback::FallbackStep;
use crate::str_utils::first_n_chars_lossy;
use crate::types::{ProviderPulse, Role};
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const SHIM_TURN_ID_HEADER: &str = "x-shim-turn-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(SHIM_TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = turn_id.parse() {
        response.headers_mut().insert(SHIM_TURN_ID_HEADER, val);
    }
    response
}

/// Logs a JSON body truncated to a readable size (`--log-body`).
pub fn log_body(label: &str, body: &serde_json::Value) {
    let text = body.to_string();
    info!(
        "{} body ({} bytes): {}",
        label,
        text.len(),
        first_n_chars_lossy(&text, LOG_BODY_MAX_CHARS)
    );
}

pub fn log_request_summary(payload: &serde_json::Value) {
    let messages = payload.get("messages").and_then(|m| m.as_array());
    let msg_count = messages.map(|m| m.len()).unwrap_or_default();
    let last_role = match messages
        .and_then(|m| m.last())
        .and_then(Role::of_message)
    {
        Some(role) => format!("{:?}", role),
        None => "NONE".into(),
    };
    let stream = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or_default();
    let client_tools = payload
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|t| t.len())
        .unwrap_or_default();

    info!(
        target: "flight_recorder",
        "[REQ] Messages: {} | Last Role: {} | Stream: {} | Client Tools: {}",
        msg_count, last_role, stream, client_tools
    );
}

/// Summary of a translated one-shot response.
pub fn log_response_summary(response_body: &serde_json::Value) {
    let choices = response_body.get("choices").and_then(|c| c.as_array());
    if let Some(first_choice) = choices.and_then(|c| c.first()) {
        let finish_reason = first_choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let tool_count = first_choice
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(|tc| tc.as_array())
            .map(|tc| tc.len())
            .unwrap_or_default();

        let content = first_choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str());
        let content_status = match content {
            None => "NULL".to_string(),
            Some("") => "EMPTY".to_string(),
            Some(s) => format!("TEXT[{}]", s.chars().count()),
        };

        if tool_count > 0 {
            warn!(
                target: "flight_recorder",
                "{}", "[PROTOCOL MISMATCH] structured tool_calls left in translated response".bold().red()
            );
        }

        info!(
            target: "flight_recorder",
            "[RES] Finish: {} | Content: {}",
            finish_reason, content_status
        );
    }
}

/// Per-turn counters for the streaming path.
#[derive(Default, Debug)]
pub struct StreamMetric {
    pub events: usize,
    pub skipped: usize,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub tool_parts: usize,
    pub tool_names: Vec<String>,
    pub fragments_sent: usize,
    pub fallback: Option<FallbackStep>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, pulse: &ProviderPulse) {
        self.events += 1;
        for choice in pulse.choices.iter().take(1) {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.chars().count();
            }
            if let Some(reasoning) = choice.delta.extract_reasoning() {
                self.reasoning_chars += reasoning.chars().count();
            }
            if let Some(tools) = &choice.delta.tool_calls {
                self.tool_parts += tools.len();
                for t in tools {
                    if let Some(name) = t.function.as_ref().and_then(|f| f.name.as_ref()) {
                        if !name.is_empty() {
                            self.tool_names.push(name.clone());
                        }
                    }
                }
            }
        }
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn log_summary(&self, completion_id: &str) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };
        let fallback = match self.fallback {
            Some(step) => format!("{:?}", step),
            None => "-".to_string(),
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] Completion: {} | Events: {} (skipped {}) | Tools: {} | Text: {} chars | Reasoning: {} chars | Sent: {} | Fallback: {}",
            completion_id,
            self.events,
            self.skipped,
            tools_str,
            self.text_chars,
            self.reasoning_chars,
            self.fragments_sent,
            fallback
        );
    }
}
