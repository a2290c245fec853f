//! Fan-in: folding sibling or loop-iteration results into one response

use crate::core::context::TemplateVars;
use crate::core::error::ExecutionError;
use crate::execution::executor::StepRun;
use crate::http::HttpResponse;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use serde_json::Value;

/// The merged result of several branches
#[derive(Debug, Clone, Default)]
pub struct Clubbed {
    pub response: Option<HttpResponse>,
    pub vars: Option<TemplateVars>,
}

/// Merge branch results, in the order given.
///
/// Any error fails the merge. A single response passes through untouched;
/// two or more become a JSON array taking the status of the last branch and
/// the headers of the first.
pub fn club_responses(
    results: Vec<Result<StepRun, ExecutionError>>,
) -> Result<Clubbed, ExecutionError> {
    let mut errors = Vec::new();
    let mut runs = Vec::new();
    for result in results {
        match result {
            Ok(run) => runs.push(run),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return Err(ExecutionError::join(errors));
    }

    let first_vars = runs.first().map(|run| run.vars.clone());
    let mut answered: Vec<(HttpResponse, TemplateVars)> = runs
        .into_iter()
        .filter_map(|run| run.response.map(|response| (response, run.vars)))
        .collect();

    if answered.len() <= 1 {
        return Ok(match answered.pop() {
            Some((response, vars)) => Clubbed {
                response: Some(response),
                vars: Some(vars),
            },
            None => Clubbed {
                response: None,
                vars: first_vars,
            },
        });
    }

    let bodies: Vec<Value> = answered
        .iter()
        .map(|(response, _)| match response.body_value() {
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        })
        .collect();

    let status = answered.last().map(|(r, _)| r.status).unwrap_or(StatusCode::OK);
    let (first, first_vars) = answered.swap_remove(0);

    let mut headers = first.headers;
    headers.remove(CONTENT_LENGTH);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let merged = Value::Array(bodies);
    let mut vars = first_vars;
    vars.body = merged.clone();

    Ok(Clubbed {
        response: Some(HttpResponse::new(status, headers, merged.to_string())),
        vars: Some(vars),
    })
}
