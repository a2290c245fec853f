//! funcflow - declarative function pipelines over HTTP backends

pub mod backend;
pub mod cli;
pub mod core;
pub mod execution;
pub mod http;
pub mod persistence;
pub mod template;

// Re-export commonly used types
pub use crate::backend::{BackendError, HttpRouteExecutor, ResolvedTarget, RouteClientConfig, RouteExecutor};
pub use crate::core::config::ProjectConfig;
pub use crate::core::{ExecutionError, Pipeline, PipelineRegistry, Step, StepState, TemplateVars};
pub use crate::execution::{ExecutionEngine, ExecutionEvent, ExecutionOutcome, ResumeOutcome, SchedulingStrategy};
pub use crate::http::{HttpRequest, HttpResponse};
pub use crate::persistence::{AsyncStore, InMemoryAsyncStore, InMemoryQueue, MessageQueue, QueueRegistry};
pub use crate::template::{HandlebarsEvaluator, TemplateEvaluator};
