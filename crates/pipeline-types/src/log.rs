//! The event shape pushed through the logging core's queue.

use serde::{Deserialize, Serialize};

/// Ordered severity, mirroring the common `TRACE < DEBUG < INFO < WARN < ERROR` scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Fine-grained diagnostic detail, off by default.
    Trace,
    /// Developer-facing detail useful when troubleshooting a single run.
    Debug,
    /// Normal operational narration (stage started, step completed).
    Info,
    /// Something unexpected happened but the run can continue.
    Warn,
    /// A failure worth surfacing to the operator.
    Error,
}

/// A single log line, pooled and reused by the logging core to avoid an
/// allocation per event on the hot path.
///
/// Fields are plain owned types rather than borrows: a pooled `LogEvent` is
/// handed to consumers across thread boundaries and its buffer is reset
/// (not deallocated) when it's returned to the pool, so `message` retains
/// its capacity between uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEvent {
    /// Severity of this line.
    pub level: LogLevelOrDefault,
    /// The formatted message body.
    pub message: String,
    /// Name of the stage this line was emitted from, if any.
    pub stage: Option<String>,
    /// Name of the step this line was emitted from, if any.
    pub step: Option<String>,
    /// Correlation id propagated from the enclosing run, for multiplexed
    /// consumers (e.g. a webhook sink serving several concurrent runs).
    pub run_id: Option<String>,
    /// Milliseconds since the logging core started, used for ordering and
    /// for batching consumers that flush on a time window.
    pub timestamp_ms: u64,
}

/// Wrapper so [`LogEvent`] can derive `Default` even though [`LogLevel`]
/// itself has no natural zero value; defaults to `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevelOrDefault(pub LogLevel);

impl Default for LogLevelOrDefault {
    fn default() -> Self {
        LogLevelOrDefault(LogLevel::Info)
    }
}

impl From<LogLevel> for LogLevelOrDefault {
    fn from(level: LogLevel) -> Self {
        LogLevelOrDefault(level)
    }
}

impl LogEvent {
    /// Reset a pooled event in place for reuse, clearing its heap-allocated
    /// fields but keeping `message`'s capacity.
    pub fn reset(&mut self) {
        self.level = LogLevelOrDefault::default();
        self.message.clear();
        self.stage = None;
        self.step = None;
        self.run_id = None;
        self.timestamp_ms = 0;
    }

    /// Construct a new event for immediate enqueue (not from the pool).
    pub fn new(level: LogLevel, message: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            stage: None,
            step: None,
            run_id: None,
            timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_order_trace_below_error() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn reset_clears_fields_but_keeps_message_capacity() {
        let mut event = LogEvent::new(LogLevel::Warn, "disk nearly full", 42);
        event.stage = Some("build".into());
        let cap_before = event.message.capacity();
        event.reset();
        assert_eq!(event.level, LogLevelOrDefault::default());
        assert!(event.message.is_empty());
        assert_eq!(event.message.capacity(), cap_before);
        assert!(event.stage.is_none());
    }
}
