//! Append-only copies of the upstream and downstream event lines of a turn.

use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Configured sink paths, shared across turns.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticTees {
    upstream: Option<PathBuf>,
    downstream: Option<PathBuf>,
}

impl DiagnosticTees {
    pub fn new(upstream: Option<PathBuf>, downstream: Option<PathBuf>) -> Self {
        Self {
            upstream,
            downstream,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.upstream.is_some() || self.downstream.is_some()
    }

    /// Sinks for one turn; lines are prefixed with `[<turn id>] `.
    pub fn for_turn(&self, turn_id: &str) -> TurnTee {
        TurnTee {
            prefix: format!("[{}] ", turn_id),
            upstream: self.upstream.as_deref().map(TeeSink::new),
            downstream: self.downstream.as_deref().map(TeeSink::new),
        }
    }
}

#[derive(Debug)]
struct TeeSink {
    path: PathBuf,
    file: Option<File>,
    failed: bool,
}

impl TeeSink {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            failed: false,
        }
    }

    async fn write_line(&mut self, prefix: &str, line: &str) {
        if self.failed {
            return;
        }
        if self.file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
            {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    tracing::warn!("Diagnostic tee {} unavailable: {}", self.path.display(), e);
                    self.failed = true;
                    return;
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            let record = format!("{}{}\n", prefix, line);
            let written = match file.write_all(record.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!("Diagnostic tee {} write failed: {}", self.path.display(), e);
                self.failed = true;
            }
        }
    }
}

/// Per-turn handle. Write failures are logged once and the sink goes quiet.
#[derive(Debug)]
pub struct TurnTee {
    prefix: String,
    upstream: Option<TeeSink>,
    downstream: Option<TeeSink>,
}

impl TurnTee {
    pub fn disabled() -> Self {
        Self {
            prefix: String::new(),
            upstream: None,
            downstream: None,
        }
    }

    pub async fn upstream(&mut self, line: &str) {
        if let Some(sink) = self.upstream.as_mut() {
            sink.write_line(&self.prefix, line).await;
        }
    }

    pub async fn downstream(&mut self, line: &str) {
        if let Some(sink) = self.downstream.as_mut() {
            sink.write_line(&self.prefix, line).await;
        }
    }
}
