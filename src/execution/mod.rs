//! Pipeline execution engine

pub mod aggregate;
pub mod async_bridge;
pub mod engine;
pub mod executor;
pub mod scheduler;
pub mod transform;

pub use aggregate::{club_responses, Clubbed};
pub use async_bridge::{AsyncBridge, ResumeOutcome};
pub use engine::{EventBus, ExecutionEngine, ExecutionEvent, ExecutionOutcome};
pub use executor::{Invocation, StepExecutor, StepRun};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
pub use transform::Transformer;
