//! Template evaluation seam
//!
//! The engine never interprets template syntax itself. It hands a template
//! string and a JSON scope to a [`TemplateEvaluator`] and receives bytes.

pub mod handlebars;

pub use self::handlebars::HandlebarsEvaluator;

use crate::core::error::ExecutionError;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Opening delimiter marking a value as a template
pub const TEMPLATE_OPEN: &str = "{{";

/// Whether a configured value must be rendered
pub fn is_template(value: &str) -> bool {
    value.trim_start().starts_with(TEMPLATE_OPEN)
}

/// Requested shape of a rendered template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Plain text
    String,
    /// A JSON document
    Json,
}

#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    /// The template referenced nothing; not an error unless asked for
    #[error("template {name}: no value")]
    NoValue { name: String },

    #[error("template {name}: {message}")]
    Compile { name: String, message: String },

    #[error("template {name}: {message}")]
    Render { name: String, message: String },
}

impl TemplateError {
    pub fn is_no_value(&self) -> bool {
        matches!(self, TemplateError::NoValue { .. })
    }
}

/// Renders templates against a scope
pub trait TemplateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        name: &str,
        template: &str,
        scope: &Value,
        kind: OutputKind,
    ) -> Result<Bytes, TemplateError>;
}

/// Collects rendering errors across a transform phase
#[derive(Debug, Default)]
pub struct TemplateErrors {
    errors: Vec<TemplateError>,
}

impl TemplateErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwrap a render result, recording the error if any
    pub fn take(&mut self, result: Result<Bytes, TemplateError>) -> Option<Bytes> {
        match result {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Join the collected errors into one.
    ///
    /// "no value" errors are dropped when `suppress` is set.
    pub fn finish(self, suppress: bool) -> Result<(), ExecutionError> {
        let mut messages = Vec::new();
        for err in self.errors {
            if suppress && err.is_no_value() {
                warn!("{}", err);
                continue;
            }
            messages.push(err.to_string());
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(ExecutionError::Template(messages.join(" , ")))
        }
    }
}
