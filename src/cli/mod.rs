//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{ConsumeCommand, ResumeCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Declarative function-pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "funcflow")]
#[command(version = "0.1.0")]
#[command(about = "Run declarative function pipelines against HTTP backends", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the project configuration file (YAML or JSON)
    #[arg(short, long, global = true, default_value = "funcflow.yaml")]
    pub config: String,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate a project configuration
    Validate(ValidateCommand),

    /// Resume a deferred step
    Resume(ResumeCommand),

    /// Drain a queue of deferred steps
    Consume(ConsumeCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
