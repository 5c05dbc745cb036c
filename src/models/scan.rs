//! In-flight scan operations, progress events and session outcomes.

use serde::{Deserialize, Serialize};

/// Terminal state of a tracked remote scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScanOutcome {
    Completed,
    TimedOut,
    Unreachable,
}

/// One in-flight spider or active scan on the Emissary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanOperation {
    pub operation_id: String,
    pub target: String,
    pub status: u8,
    pub alert_count: u64,
    pub outcome: Option<ScanOutcome>,
}

impl ScanOperation {
    pub fn new(operation_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            target: target.into(),
            status: 0,
            alert_count: 0,
            outcome: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status >= 100
    }
}

/// Live progress published on each active-scan tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub percent_complete: u8,
    pub alert_count: u64,
}

/// Post-scan evaluation for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub alert_count: u64,
    pub alert_threshold: u32,
    pub passed: bool,
}

impl Verdict {
    pub fn evaluate(alert_count: u64, alert_threshold: u32) -> Self {
        Self {
            alert_count,
            alert_threshold,
            passed: alert_count <= u64::from(alert_threshold),
        }
    }
}

/// How a session's execution unit ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SessionExit {
    Passed,
    Failed,
    Errored { code: i32 },
    Terminated { signal: Option<i32> },
    NotStarted { reason: String },
}

impl SessionExit {
    pub const PASS_CODE: i32 = 0;
    pub const FAIL_CODE: i32 = 1;
    pub const ERROR_CODE: i32 = 2;

    /// Map a child exit code (or its absence, meaning a signal) to an outcome.
    pub fn from_code(code: Option<i32>, signal: Option<i32>) -> Self {
        match code {
            Some(Self::PASS_CODE) => Self::Passed,
            Some(Self::FAIL_CODE) => Self::Failed,
            Some(code) => Self::Errored { code },
            None => Self::Terminated { signal },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}
