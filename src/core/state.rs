//! Execution state models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of one step invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Not started yet
    Pending,
    /// Rendering the step's condition
    ConditionEval,
    /// Condition failed with IGNORE; the step's own target was not called
    Skipped,
    /// Dispatching the target call (or loop iterations)
    Executing,
    /// Reshaping the backend response into the scope
    Reshaping,
    /// Visiting child steps
    Children,
    /// Finished, children folded in
    Done,
    /// Halted by a failed condition or a backend error under STOP
    Stopped {
        reason: String,
    },
    /// Handed off to the async queue
    Deferred {
        async_id: String,
    },
}

impl StepState {
    /// Check if the invocation reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Done | StepState::Stopped { .. } | StepState::Deferred { .. }
        )
    }
}

/// Status of a persisted async resumption row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncStatus {
    /// Waiting for a consumer
    Pending,
    /// Resumed and finished
    Processed,
    /// Could not be resumed, or resumption failed
    Failed,
}

impl AsyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncStatus::Pending => "PENDING",
            AsyncStatus::Processed => "PROCESSED",
            AsyncStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AsyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AsyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AsyncStatus::Pending),
            "PROCESSED" => Ok(AsyncStatus::Processed),
            "FAILED" => Ok(AsyncStatus::Failed),
            other => Err(format!("unknown async status: {}", other)),
        }
    }
}
