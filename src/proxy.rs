//! HTTP surface: the chat-completions handler and the router.

use crate::compose::{RequestComposer, TurnContext};
use crate::constants::MAX_UPSTREAM_LINE_BYTES;
use crate::health;
use crate::logging::{log_body, log_request_summary, log_response_summary, turn_id_middleware};
use crate::oneshot::translate_response;
use crate::streaming::{Frame, StreamHandler, StreamTranslator, UpstreamLineCodec};
use crate::types::{ObservedError, Result, ShimError};
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, State},
    middleware,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tracing::Instrument;

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/", get(health::root))
        .route("/health", get(health::liveness))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(turn_id_middleware))
        .with_state(state)
}

pub async fn chat_completions_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Rejecting unparsable request: {}", e);
            return ObservedError::from(ShimError::InvalidRequest(format!("invalid JSON: {}", e)))
                .into_response();
        }
    };

    if state.args.log_body {
        log_body("[🖱️  -> ⚙️ ] Client", &payload);
    }
    log_request_summary(&payload);

    let composer = RequestComposer::new(&state.compose, &state.resolver);
    let (outgoing, turn) = match composer.compose(payload) {
        Ok(composed) => composed,
        Err(e) => {
            tracing::warn!("[🖱️  -> ⚙️ ] Rejecting request: {}", e.inner);
            return e.into_response();
        }
    };

    if state.args.log_body {
        log_body("[⚙️  -> ☁️ ] Upstream", &outgoing);
    }

    if turn.stream {
        stream_turn(state, outgoing, turn).await
    } else {
        one_shot_turn(state, outgoing, turn).await
    }
}

async fn send_upstream(state: &AppState, body: &serde_json::Value) -> Result<reqwest::Response> {
    let mut request = state.client.post(state.args.upstream_url()).json(body);
    if let Some(key) = state.args.upstream_api_key.as_deref().filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }
    Ok(request.send().await?)
}

async fn stream_turn(state: Arc<AppState>, outgoing: serde_json::Value, turn: TurnContext) -> Response {
    let completion_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let translator = StreamTranslator::new(
        completion_id.clone(),
        turn.model.clone(),
        state.converter_for(turn.specs.clone()),
        state.args.fallback_chain(),
        state.args.stream_settings(),
    );
    let tee = state.tees.for_turn(&completion_id);
    let (tx, rx) = mpsc::channel::<Frame>(100);
    let stream_span = tracing::info_span!(
        "stream",
        completion_id = %completion_id,
        model = %turn.model,
        mode = %turn.mode
    );

    match send_upstream(&state, &outgoing).await {
        Ok(response) if response.status().is_success() => {
            tracing::info!("[☁️  -> ⚙️ ] Status: {}", response.status());
            let bytes_stream = response
                .bytes_stream()
                .map(|r| r.map_err(std::io::Error::other));
            let lines_stream = FramedRead::new(
                tokio_util::io::StreamReader::new(bytes_stream),
                UpstreamLineCodec::new_with_max_length(MAX_UPSTREAM_LINE_BYTES),
            );
            tokio::spawn(
                StreamHandler::handle_stream(lines_stream, translator, tx, tee).instrument(stream_span),
            );
        }
        Ok(response) => {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("Upstream error (body unreadable): {}", e),
            };
            tracing::error!(
                "[☁️  -> ⚙️ ] Upstream returned {}; answering with fallback: {}",
                status,
                crate::str_utils::first_n_chars_lossy(&error_body, 500)
            );
            tokio::spawn(StreamHandler::handle_empty(translator, tx, tee).instrument(stream_span));
        }
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Upstream unreachable; answering with fallback: {}", e.inner);
            tokio::spawn(StreamHandler::handle_empty(translator, tx, tee).instrument(stream_span));
        }
    }

    let events = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Sse::new(events).keep_alive(sse_keep_alive()).into_response()
}

/// axum renders the text as an SSE comment line; it must not carry its own colon.
fn sse_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keepalive")
}

async fn one_shot_turn(state: Arc<AppState>, outgoing: serde_json::Value, turn: TurnContext) -> Response {
    let response = match send_upstream(&state, &outgoing).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Upstream request failed: {}", e.inner);
            return e.into_response();
        }
    };
    let status = response.status();
    tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

    let raw = match response.bytes().await {
        Ok(b) => b,
        Err(e) => return ObservedError::from(e).into_response(),
    };
    let mut body: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(e) => {
            let text = String::from_utf8_lossy(&raw);
            tracing::error!(
                "[☁️  -> ⚙️ ] Upstream body is not JSON ({}): {}",
                e,
                crate::str_utils::first_n_chars_lossy(&text, 500)
            );
            let err = if status.is_success() {
                ShimError::BadUpstreamPayload(format!("upstream returned invalid JSON: {}", e))
            } else {
                ShimError::Upstream(status, text.into_owned())
            };
            return ObservedError::from(err).into_response();
        }
    };

    if body.get("choices").is_none() {
        tracing::warn!("[☁️  -> ⚙️ ] Upstream response has no choices; passing through");
        return (status, Json(body)).into_response();
    }

    let converter = state.converter_for(turn.specs);
    translate_response(&mut body, &converter);
    if state.args.log_body {
        log_body("[⚙️  -> 🖱️ ] Client", &body);
    }
    log_response_summary(&body);

    (status, Json(body)).into_response()
}
