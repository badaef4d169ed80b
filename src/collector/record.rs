use std::fmt;

use serde::{Deserialize, Serialize};

/// Which output stream of the container a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl AsRef<str> for LogStream {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A single log line as produced by the log source, before it is tagged
/// with the container it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogLine {
    pub stream: LogStream,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub message: String,
}

/// A log line tagged with its container, as pushed onto the output queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub container_id: String,
    pub stream: LogStream,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub message: String,
}

impl LogRecord {
    pub fn tagged(container_id: &str, line: RawLogLine) -> Self {
        Self {
            container_id: container_id.to_string(),
            stream: line.stream,
            timestamp: line.timestamp,
            message: line.message,
        }
    }
}

/// How many lines of history the log source should replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    All,
    Lines(u64),
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tail::All => f.write_str("all"),
            Tail::Lines(n) => write!(f, "{n}"),
        }
    }
}

/// Parameters a worker hands verbatim to the log source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Timestamp in microseconds (UTC)
    pub since: Option<i64>,
    pub tail: Tail,
}

impl StreamOptions {
    /// Options for a container resuming from `cursor`.
    ///
    /// Without a cursor only new lines are streamed. With one, everything
    /// since the cursor is replayed so nothing between restarts is lost.
    pub fn resume_from(cursor: Option<i64>) -> Self {
        match cursor {
            Some(since) => Self {
                since: Some(since),
                tail: Tail::All,
            },
            None => Self {
                since: None,
                tail: Tail::Lines(0),
            },
        }
    }
}
