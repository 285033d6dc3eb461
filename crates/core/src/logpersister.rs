//! Stage log sinks.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// Receives the user-facing log of one stage execution.
pub trait StageLogPersister: Send + Sync {
    fn info(&self, msg: &str);
    fn success(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Flush and close; called once when the stage ends.
    fn complete(&self, _timeout: Duration) {}
}

/// Forwards stage logs to `tracing`.
#[derive(Debug, Clone)]
pub struct TracingLogPersister {
    stage_id: String,
}

impl TracingLogPersister {
    pub fn new(stage_id: impl Into<String>) -> Self { Self { stage_id: stage_id.into() } }
}

impl StageLogPersister for TracingLogPersister {
    fn info(&self, msg: &str) { info!(stage = %self.stage_id, "{}", msg); }
    fn success(&self, msg: &str) { info!(stage = %self.stage_id, success = true, "{}", msg); }
    fn error(&self, msg: &str) { error!(stage = %self.stage_id, "{}", msg); }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub severity: LogSeverity,
    pub text: String,
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct BufferLogPersister {
    lines: Mutex<Vec<LogLine>>,
}

impl BufferLogPersister {
    pub fn new() -> Self { Self::default() }

    pub fn lines(&self) -> Vec<LogLine> { self.lines.lock().clone() }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.text.contains(needle))
    }

    fn push(&self, severity: LogSeverity, msg: &str) {
        self.lines.lock().push(LogLine { severity, text: msg.to_string() });
    }
}

impl StageLogPersister for BufferLogPersister {
    fn info(&self, msg: &str) { self.push(LogSeverity::Info, msg); }
    fn success(&self, msg: &str) { self.push(LogSeverity::Success, msg); }
    fn error(&self, msg: &str) { self.push(LogSeverity::Error, msg); }
}
