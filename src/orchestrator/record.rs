//! Test records, start parameters, and completion events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Spawned, waiting for the helper's first `running` line.
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Completed => write!(f, "completed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the UI sends to start a test. Only `name` and `duration` are read
/// here; everything else is forwarded to the helper untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    pub name: String,
    /// Requested run time in minutes. Advisory; never enforced by the host.
    #[serde(default)]
    pub duration: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestParams {
    pub fn new(name: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            duration,
            extra: serde_json::Map::new(),
        }
    }
}

/// Caller-visible snapshot of one test. The process handle is kept by the
/// orchestrator and never appears here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    #[serde(rename = "id")]
    pub test_id: String,
    pub name: String,
    #[serde(rename = "duration")]
    pub requested_duration_minutes: f64,
    /// When the helper was spawned, not when it confirmed.
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TestStatus,
    pub log_file_path: Option<String>,
}

/// Pushed to subscribers when a test ends on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub test_id: String,
    pub status: TestStatus,
    pub end_time: DateTime<Utc>,
}
