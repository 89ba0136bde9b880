//! Wire protocol — requests, replies and progress events exchanged between
//! the dispatcher and the executor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag linking a dispatched request to its result and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u32);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution strategy on the executor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Collect all output and report it at exit.
    Buffered,
    /// Forward error-stream chunks as progress while running.
    Streaming,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Buffered => "execute",
            Mode::Streaming => "spawn",
        }
    }
}

/// A single command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: CorrelationId,
    pub directory: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub watch_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Execute(CommandRequest),
    Spawn(CommandRequest),
    Which { command: String },
    Kill { id: CorrelationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Spawn,
    Execution,
    UnknownProcess,
}

/// Typed error carried back across the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Exactly one reply per request: captured output or a failure.
pub type Reply = Result<String, Failure>;

/// Error-stream chunk forwarded while a streaming command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub correlation_id: CorrelationId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub data: String,
}

impl ProgressEvent {
    pub fn now(correlation_id: CorrelationId, data: String) -> Self {
        Self {
            correlation_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// Strip exactly one trailing newline.
pub fn trim_eol(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}
