//! Core domain models
//!
//! Configuration, the step tree, conditions, variable scopes and errors.

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod state;
pub mod step;

pub use context::*;
pub use error::{ExecutionError, Result};
pub use pipeline::*;
pub use state::*;
pub use step::*;
