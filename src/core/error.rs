//! Error taxonomy for pipeline execution

use crate::http::HttpResponse;
use http::StatusCode;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors raised while executing a pipeline
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Malformed configuration reached the engine
    #[error("Invalid pipeline: {0}")]
    Validation(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// One or more templates failed to render
    #[error("{0}")]
    Template(String),

    #[error("loop variable is not an array: {0}")]
    LoopNotArray(String),

    /// Condition rendered false under the ERROR policy
    #[error("{message}")]
    ConditionFailed { message: String },

    /// Backend call failed or answered >= 400 under the STOP policy
    #[error("{message}")]
    Backend {
        message: String,
        response: Option<HttpResponse>,
    },

    /// Publishing to the queue or persisting resumption state failed
    #[error("Async hand-off failed: {0}")]
    AsyncPersistence(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Execution cancelled")]
    Cancelled,

    /// Several sibling branches failed
    #[error("{0}")]
    Joined(String),
}

impl ExecutionError {
    /// Join several branch errors into one, keeping a lone error intact
    pub fn join(mut errors: Vec<ExecutionError>) -> ExecutionError {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(" , ");
        ExecutionError::Joined(message)
    }

    /// Render the error as the HTTP response a caller sees.
    ///
    /// A backend response carrying its own error status is passed through;
    /// everything else becomes `{"error": "..."}` with 400 or the override.
    pub fn to_response(&self, status_override: Option<u16>) -> HttpResponse {
        if let ExecutionError::Backend {
            response: Some(response),
            ..
        } = self
        {
            return response.clone();
        }

        let status = status_override
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::BAD_REQUEST);
        HttpResponse::json(status, &serde_json::json!({ "error": self.to_string() }))
    }
}
