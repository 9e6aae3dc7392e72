//! Per-turn translation of the upstream event stream into client chunks.
//!
//! [`StreamTranslator`] is a synchronous state machine: every upstream line
//! yields zero or more [`Frame`]s, in the order they must reach the client.
//! [`StreamHandler::handle_stream`] drives it from the upstream line stream
//! and forwards the frames to the SSE channel.

use crate::convert::{PendingToolCall, ToolConverter};
use crate::fallback::FallbackChain;
use crate::logging::StreamMetric;
use crate::specs::openai::{ChatCompletionChunk, ChunkDelta};
use crate::tee::TurnTee;
use crate::types::{parse_provider_line, LineEvent, ProviderPulse, ProviderToolCallDelta};
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, LinesCodecError};

const DONE_SENTINEL: &str = "[DONE]";
const TOOL_FINISH_REASONS: &[&str] = &["tool_calls", "tool_call", "function_call"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitingUpstream,
    Relaying,
    Finished,
}

/// One event on the downstream SSE channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Chunk(ChatCompletionChunk),
    Done,
}

impl Frame {
    /// The `data:` payload of the SSE event.
    pub fn data(&self) -> String {
        match self {
            Frame::Chunk(chunk) => match serde_json::to_string(chunk) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize chunk {}: {}", chunk.id, e);
                    "{}".to_string()
                }
            },
            Frame::Done => DONE_SENTINEL.to_string(),
        }
    }

    pub fn into_event(self) -> axum::response::sse::Event {
        axum::response::sse::Event::default().data(self.data())
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Frame::Chunk(chunk) => chunk.content(),
            Frame::Done => None,
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match self {
            Frame::Chunk(chunk) => chunk.finish_reason(),
            Frame::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishCause {
    Sentinel,
    Stop,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Buffered text is flushed once it holds this many characters.
    pub text_flush_threshold: usize,
    pub log_reasoning: bool,
    pub trace_stream: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            text_flush_threshold: 256,
            log_reasoning: false,
            trace_stream: false,
        }
    }
}

pub struct StreamTranslator {
    id: String,
    model: String,
    phase: StreamPhase,
    text_buffer: String,
    tool_buffer: BTreeMap<u32, PendingToolCall>,
    reasoning_buffer: Vec<String>,
    sent_any_content: bool,
    emitted_tool_xml: bool,
    converter: ToolConverter,
    fallback: FallbackChain,
    settings: StreamSettings,
    metrics: StreamMetric,
}

impl StreamTranslator {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        converter: ToolConverter,
        fallback: FallbackChain,
        settings: StreamSettings,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            phase: StreamPhase::AwaitingUpstream,
            text_buffer: String::new(),
            tool_buffer: BTreeMap::new(),
            reasoning_buffer: Vec::new(),
            sent_any_content: false,
            emitted_tool_xml: false,
            converter,
            fallback,
            settings,
            metrics: StreamMetric::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == StreamPhase::Finished
    }

    pub fn sent_any_content(&self) -> bool {
        self.sent_any_content
    }

    pub fn emitted_tool_xml(&self) -> bool {
        self.emitted_tool_xml
    }

    /// The opening role chunk. Only the first call produces a frame.
    pub fn start(&mut self) -> Vec<Frame> {
        if self.phase != StreamPhase::AwaitingUpstream {
            return Vec::new();
        }
        self.phase = StreamPhase::Relaying;
        vec![self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        )]
    }

    pub fn process_line(&mut self, line: &str) -> Vec<Frame> {
        let mut frames = self.start();
        if self.is_finished() {
            return frames;
        }

        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return frames;
        }
        if self.settings.trace_stream {
            tracing::info!("[☁️  -> ⚙️ ] {}", line);
        }

        let data = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            None => line,
        };
        if data == DONE_SENTINEL {
            tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
            frames.extend(self.finish(FinishCause::Sentinel));
            return frames;
        }

        match parse_provider_line(data) {
            LineEvent::Pulse(pulse) => frames.extend(self.handle_pulse(pulse)),
            LineEvent::Error(err) => {
                self.metrics.record_skipped();
                tracing::warn!(
                    "[☁️  -> ⚙️ ] Upstream error event skipped: {}",
                    err.error.message
                );
            }
            LineEvent::Unknown(_) => {
                self.metrics.record_skipped();
                tracing::warn!(
                    "[☁️  -> ⚙️ ] Skipping malformed upstream line: {}",
                    crate::str_utils::first_n_chars_lossy(data, 200)
                );
            }
        }
        frames
    }

    /// Ends the turn after a transport failure or an unterminated stream.
    pub fn abort(&mut self, reason: &str) -> Vec<Frame> {
        let mut frames = self.start();
        if self.is_finished() {
            return frames;
        }
        tracing::warn!("[☁️  -> ⚙️ ] Upstream stream ended abnormally: {}", reason);
        frames.extend(self.finish(FinishCause::Aborted));
        frames
    }

    fn handle_pulse(&mut self, pulse: ProviderPulse) -> Vec<Frame> {
        self.metrics.record_chunk(&pulse);
        let mut frames = Vec::new();
        let choice = match pulse.choices.into_iter().next() {
            Some(c) => c,
            None => return frames,
        };
        let delta = choice.delta;

        if let Some(reasoning) = delta.extract_reasoning() {
            if self.settings.log_reasoning {
                tracing::debug!("[☁️  -> ⚙️ ] reasoning: {}", reasoning);
            }
            self.reasoning_buffer.push(reasoning);
        }

        let tool_fragments = delta.tool_calls.unwrap_or_default();
        if !tool_fragments.is_empty() {
            self.accumulate_tool_fragments(tool_fragments);
        } else if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            self.text_buffer.push_str(&text);
            if self.text_buffer.chars().count() >= self.settings.text_flush_threshold
                || self.text_buffer.contains('\n')
            {
                frames.extend(self.flush_text(None));
            }
        }

        match choice.finish_reason.as_deref() {
            Some(reason) if TOOL_FINISH_REASONS.contains(&reason) => {
                tracing::debug!("[☁️  -> ⚙️ ] Tool-call completion ({})", reason);
                frames.extend(self.flush_text(None));
                frames.extend(self.flush_tools(None));
            }
            Some("stop") => frames.extend(self.finish(FinishCause::Stop)),
            Some(other) => tracing::debug!("[☁️  -> ⚙️ ] finish_reason '{}' noted", other),
            None => {}
        }
        frames
    }

    fn accumulate_tool_fragments(&mut self, fragments: Vec<ProviderToolCallDelta>) {
        for fragment in fragments {
            let slot = self.tool_buffer.entry(fragment.index).or_default();
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    slot.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    slot.arguments.push_str(&arguments);
                }
            }
        }
    }

    fn finish(&mut self, cause: FinishCause) -> Vec<Frame> {
        let mut frames = Vec::new();
        let text_is_last = self.tool_buffer.is_empty();

        frames.extend(self.flush_text(text_is_last.then_some("stop")));
        frames.extend(self.flush_tools(Some("stop")));

        if !self.sent_any_content {
            let synthesized = self.fallback.synthesize(&self.reasoning_buffer);
            self.metrics.fallback = Some(synthesized.step);
            frames.push(self.emit(synthesized.content, Some("stop")));
        } else if frames.is_empty() && cause == FinishCause::Stop {
            frames.push(self.chunk(ChunkDelta::default(), Some("stop")));
        }

        frames.push(Frame::Done);
        self.phase = StreamPhase::Finished;
        if cause == FinishCause::Aborted {
            tracing::debug!("[⚙️ ] Turn {} closed after abort", self.id);
        }
        self.metrics.log_summary(&self.id);
        frames
    }

    fn flush_text(&mut self, finish_reason: Option<&str>) -> Option<Frame> {
        if self.text_buffer.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.text_buffer);
        Some(self.emit(text, finish_reason))
    }

    fn flush_tools(&mut self, finish_reason: Option<&str>) -> Option<Frame> {
        if self.tool_buffer.is_empty() {
            return None;
        }
        let buffered = std::mem::take(&mut self.tool_buffer);
        let xml = self
            .converter
            .convert_batch(buffered.iter().map(|(index, call)| (*index, call)));
        tracing::info!(
            "[⚙️  -> 🖱️ ] Emitting tool XML for {} buffered call(s): {}",
            buffered.len(),
            crate::str_utils::first_n_chars_lossy(&xml, 200)
        );
        self.emitted_tool_xml = true;
        Some(self.emit(xml, finish_reason))
    }

    fn emit(&mut self, content: String, finish_reason: Option<&str>) -> Frame {
        if !content.is_empty() {
            self.sent_any_content = true;
        }
        self.metrics.fragments_sent += 1;
        self.chunk(
            ChunkDelta {
                role: None,
                content: Some(content),
            },
            finish_reason,
        )
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> Frame {
        Frame::Chunk(ChatCompletionChunk::new(
            &self.id,
            &self.model,
            delta,
            finish_reason,
        ))
    }
}

/// Newline framing for the upstream body. Unlike `LinesCodec`, a line that
/// is not valid UTF-8 is decoded lossily instead of failing the stream.
#[derive(Debug, Clone)]
pub struct UpstreamLineCodec {
    max_length: usize,
    next_index: usize,
}

impl UpstreamLineCodec {
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    fn decode_line(raw: &[u8]) -> String {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match std::str::from_utf8(line) {
            Ok(text) => text.to_string(),
            Err(e) => {
                tracing::warn!("[☁️  -> ⚙️ ] Upstream line is not valid UTF-8 ({}), decoding lossily", e);
                String::from_utf8_lossy(line).into_owned()
            }
        }
    }
}

impl Decoder for UpstreamLineCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, LinesCodecError> {
        let start = self.next_index.min(buf.len());
        match buf[start..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;
                if end > self.max_length {
                    buf.clear();
                    return Err(LinesCodecError::MaxLineLengthExceeded);
                }
                let raw = buf.split_to(end + 1);
                Ok(Some(Self::decode_line(&raw)))
            }
            None if buf.len() > self.max_length => {
                self.next_index = 0;
                buf.clear();
                Err(LinesCodecError::MaxLineLengthExceeded)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, LinesCodecError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let remaining = buf.len();
        let raw = buf.split_to(remaining);
        Ok(Some(Self::decode_line(&raw)))
    }
}

pub struct StreamHandler;

impl StreamHandler {
    /// Drives `translator` until it finishes, the upstream ends or the client
    /// goes away.
    pub async fn handle_stream<S>(
        mut lines: S,
        mut translator: StreamTranslator,
        tx: mpsc::Sender<Frame>,
        mut tee: TurnTee,
    ) where
        S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    {
        let opening = translator.start();
        if !Self::send_frames(&tx, &mut tee, opening).await {
            return;
        }

        while let Some(line_result) = lines.next().await {
            let frames = match line_result {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    tee.upstream(&line).await;
                    translator.process_line(&line)
                }
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", e);
                    translator.abort(&e.to_string())
                }
            };
            if !Self::send_frames(&tx, &mut tee, frames).await {
                return;
            }
            if translator.is_finished() {
                return;
            }
        }

        let frames = translator.abort("upstream closed without a terminator");
        Self::send_frames(&tx, &mut tee, frames).await;
    }

    /// Serves a turn whose upstream produced no stream at all.
    pub async fn handle_empty(
        translator: StreamTranslator,
        tx: mpsc::Sender<Frame>,
        tee: TurnTee,
    ) {
        let nothing = futures_util::stream::empty::<std::result::Result<String, LinesCodecError>>();
        Self::handle_stream(nothing, translator, tx, tee).await;
    }

    async fn send_frames(tx: &mpsc::Sender<Frame>, tee: &mut TurnTee, frames: Vec<Frame>) -> bool {
        for frame in frames {
            tee.downstream(&format!("data: {}", frame.data())).await;
            if tx.send(frame).await.is_err() {
                tracing::info!("[⚙️  -> 🖱️ ] Client disconnected, abandoning upstream stream");
                return false;
            }
        }
        true
    }
}
