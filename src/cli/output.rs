//! CLI output formatting

use crate::core::{AsyncStatus, StepState};
use crate::execution::{ExecutionEvent, ResumeOutcome};
use crate::http::HttpResponse;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a step state for display
pub fn format_step_state(state: &StepState) -> String {
    match state {
        StepState::Pending => style("PENDING").dim().to_string(),
        StepState::ConditionEval | StepState::Executing | StepState::Reshaping => {
            style("RUNNING").yellow().to_string()
        }
        StepState::Children => style("CHILDREN").yellow().to_string(),
        StepState::Skipped => style("SKIPPED").dim().to_string(),
        StepState::Done => style("DONE").green().to_string(),
        StepState::Stopped { reason } => style(format!("STOPPED ({})", reason)).yellow().to_string(),
        StepState::Deferred { async_id } => {
            style(format!("DEFERRED ({})", async_id)).blue().to_string()
        }
    }
}

/// Format an async row status for display
pub fn format_async_status(status: AsyncStatus) -> String {
    match status {
        AsyncStatus::Pending => style("PENDING").dim().to_string(),
        AsyncStatus::Processed => style("PROCESSED").green().to_string(),
        AsyncStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            invocation_id,
        } => format!(
            "{} Starting pipeline {} ({})",
            ROCKET,
            style(pipeline_name).bold(),
            style(&invocation_id.to_string()[..8]).dim()
        ),
        ExecutionEvent::StepStarted { step_key, .. } => {
            format!("{} {}", SPINNER, style(step_key).cyan())
        }
        ExecutionEvent::StepSkipped {
            step_key, reason, ..
        } => format!("{} {} ({})", INFO, style(step_key).dim(), reason),
        ExecutionEvent::StepDeferred {
            step_key, async_id, ..
        } => format!(
            "{} {} deferred as {}",
            INFO,
            style(step_key).blue(),
            style(async_id).dim()
        ),
        ExecutionEvent::StepCompleted {
            step_key, status, ..
        } => match status {
            Some(status) => format!("{} {} → {}", CHECK, style(step_key).green(), status),
            None => format!("{} {}", CHECK, style(step_key).green()),
        },
        ExecutionEvent::StepFailed {
            step_key, error, ..
        } => format!("{} {}: {}", CROSS, style(step_key).red(), style(error).dim()),
        ExecutionEvent::PipelineCompleted {
            pipeline_name,
            status,
            success,
            ..
        } => {
            let status_str = if *success {
                format!("{} ({})", style("completed").green(), status)
            } else {
                format!("{} ({})", style("failed").red(), status)
            };
            format!("{} Pipeline {} {}", INFO, style(pipeline_name).bold(), status_str)
        }
    }
}

/// Status line plus body, pretty-printed when it is JSON
pub fn format_response(response: &HttpResponse) -> String {
    let status = if response.is_error() {
        style(response.status.to_string()).red()
    } else {
        style(response.status.to_string()).green()
    };
    let body = match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(&response.body).into_owned(),
    };
    format!("{}\n{}", status, body)
}

/// One line per resumed async id
pub fn format_resume_outcome(async_id: &str, outcome: &ResumeOutcome) -> String {
    let detail = match outcome {
        ResumeOutcome::Processed(response) => response.status.to_string(),
        ResumeOutcome::Failed(reason) => reason.clone(),
        ResumeOutcome::Duplicate(_) => "already handled".to_string(),
    };
    let icon = match outcome {
        ResumeOutcome::Processed(_) => CHECK,
        ResumeOutcome::Failed(_) => CROSS,
        ResumeOutcome::Duplicate(_) => WARN,
    };
    format!(
        "{} {} {} {}",
        icon,
        style(async_id).dim(),
        format_async_status(outcome.status()),
        detail
    )
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
