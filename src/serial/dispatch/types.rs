//! Dispatch loop state, counters and errors.
use serde::{Deserialize, Serialize};

use crate::serial::SerialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Server was stopped and its transport released")]
    TransportReleased,

    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("Serial error: {0}")]
    Serial(#[from] SerialError),

    #[error("Reader task failed: {0}")]
    ReaderPanicked(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Running totals published by the reader task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub lines_read: u64,
    pub passthrough_lines: u64,
    pub istest_commands: u64,
    pub value_requests: u64,
    pub events_reported: u64,
    pub device_logs: u64,
    pub replies_sent: u64,
    pub ignored_lines: u64,
    pub utf8_decode_errors: u64,
    pub partial_buffer_trims: u64,
    pub last_error: Option<String>,
}

impl DispatchMetrics {
    pub fn commands_handled(&self) -> u64 {
        self.istest_commands + self.value_requests + self.events_reported + self.device_logs
    }
}

/// Reader tuning taken from `ServerConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    pub poll_interval_ms: u64,
    pub read_chunk: usize,
    pub max_partial_line: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 25,
            read_chunk: 512,
            max_partial_line: 8192,
        }
    }
}
