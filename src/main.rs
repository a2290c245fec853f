use anyhow::{Context, Result};
use funcflow::cli::commands::{ConsumeCommand, ResumeCommand, RunCommand, ValidateCommand};
use funcflow::cli::output::*;
use funcflow::cli::{Cli, Command};
use funcflow::core::config::ProjectConfig;
use funcflow::execution::{ExecutionEngine, ResumeOutcome};
use funcflow::http::HttpRequest;
use funcflow::persistence::{QueueRegistry, SqliteAsyncStore, SqliteQueue, DEFAULT_VISIBILITY_TIMEOUT};
use funcflow::{HttpRouteExecutor, RouteClientConfig};
use http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Ctrl-C cancels whatever is in flight
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match &cli.command {
        Command::Run(cmd) => run_pipeline(&cli, cmd, cancel).await?,
        Command::Validate(cmd) => validate_project(&cli, cmd)?,
        Command::Resume(cmd) => resume_step(&cli, cmd, cancel).await?,
        Command::Consume(cmd) => consume_queue(&cli, cmd, cancel).await?,
    }

    Ok(())
}

/// Engine over the reqwest transport and SQLite-backed async hand-off
async fn build_engine(config: &ProjectConfig, db: Option<&str>) -> Result<ExecutionEngine> {
    let store = match db {
        Some(path) => SqliteAsyncStore::new(path).await?,
        None => SqliteAsyncStore::with_default_path().await?,
    };

    let mut queues = QueueRegistry::new().with_default(config.settings.default_queue.clone());
    for name in config.queue_names() {
        queues.register(Arc::new(SqliteQueue::new(
            store.pool(),
            &name,
            DEFAULT_VISIBILITY_TIMEOUT,
        )));
    }

    let backend = HttpRouteExecutor::new(RouteClientConfig::new())?;
    let engine = ExecutionEngine::new(
        config.to_registry()?,
        Arc::new(backend),
        Arc::new(store),
        queues,
    );

    engine.add_event_handler(|event| println!("{}", format_execution_event(&event)));
    Ok(engine)
}

fn load_project(cli: &Cli) -> Result<ProjectConfig> {
    ProjectConfig::from_file(&cli.config).context("Failed to load project config")
}

fn inbound_request(cmd: &RunCommand) -> Result<HttpRequest> {
    let method = Method::from_bytes(cmd.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid method '{}'", cmd.method))?;
    let mut request = HttpRequest::new(method, &format!("http://localhost/{}", cmd.pipeline))?;

    if !cmd.query.is_empty() {
        let params: BTreeMap<String, String> = cmd.query.iter().cloned().collect();
        request.set_query(&params);
    }
    for (key, value) in &cmd.header {
        request = request.with_header(key, value);
    }

    if let Some(body) = &cmd.body {
        let raw = match body.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read body from {}", path))?,
            None => body.clone(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("Body is not valid JSON")?;
        request = request.with_json_body(&value);
    }

    Ok(request)
}

async fn run_pipeline(cli: &Cli, cmd: &RunCommand, cancel: CancellationToken) -> Result<()> {
    let config = load_project(cli)?;
    println!(
        "{} Loaded project: {} pipeline(s), {} route(s)",
        INFO,
        style(config.func_groups.len()).cyan(),
        style(config.routes.len()).cyan()
    );

    let engine = build_engine(&config, cmd.db.as_deref()).await?;
    let request = inbound_request(cmd)?;

    println!();
    let result = engine
        .execute(cancel, request, &cmd.pipeline, cmd.step.as_deref())
        .await;

    match result {
        Ok(outcome) => {
            println!("\n{}", format_output(&format_response(&outcome.response), 40));
        }
        Err(e) => {
            let status_override = engine
                .registry()
                .pipeline(&cmd.pipeline)
                .and_then(|p| p.response_status_code);
            println!("\n{}", format_response(&e.to_response(status_override)));
            error!("{}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn validate_project(cli: &Cli, cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating project...", INFO);

    let result = ProjectConfig::from_file(&cli.config).and_then(|config| {
        let registry = config.to_registry()?;
        Ok((config, registry))
    });

    match result {
        Ok((config, registry)) => {
            println!("{} Project configuration is valid!", CHECK);
            println!("  Routes: {}", style(config.routes.len()).cyan());
            for name in registry.pipeline_names() {
                let steps = registry.pipeline(name).map(|p| p.step_count()).unwrap_or(0);
                println!("  {} ({} steps)", style(name).bold(), style(steps).cyan());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn resume_step(cli: &Cli, cmd: &ResumeCommand, cancel: CancellationToken) -> Result<()> {
    let config = load_project(cli)?;
    let engine = build_engine(&config, cmd.db.as_deref()).await?;

    let outcome = engine.resume(cancel, &cmd.async_id).await?;
    println!("{}", format_resume_outcome(&cmd.async_id, &outcome));
    match outcome {
        ResumeOutcome::Processed(response) => println!("{}", format_response(&response)),
        ResumeOutcome::Failed(_) => std::process::exit(1),
        ResumeOutcome::Duplicate(_) => {}
    }
    Ok(())
}

async fn consume_queue(cli: &Cli, cmd: &ConsumeCommand, cancel: CancellationToken) -> Result<()> {
    let config = load_project(cli)?;
    let engine = build_engine(&config, cmd.db.as_deref()).await?;

    let outcomes = engine
        .consume(cancel, cmd.queue.as_deref(), cmd.max)
        .await?;
    if outcomes.is_empty() {
        println!("{} No deferred steps waiting", INFO);
        return Ok(());
    }
    for (async_id, outcome) in &outcomes {
        println!("{}", format_resume_outcome(async_id, outcome));
    }
    Ok(())
}
