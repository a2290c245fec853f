//! Step executor - runs one step invocation through its state machine
//!
//! delay -> scope -> loop values -> outbound request -> condition ->
//! (defer | execute) -> reshape -> children. Sibling steps and loop iterations fan out through
//! their own [`ExecutionScheduler`].

use crate::backend::{BackendError, ResolvedTarget, RouteExecutor};
use crate::core::condition::{ConditionOutcome, OnErrorPolicy};
use crate::core::context::{ScopeSnapshot, StepScopes, TemplateVars};
use crate::core::error::{ExecutionError, Result};
use crate::core::pipeline::{Pipeline, PipelineRegistry};
use crate::core::state::StepState;
use crate::core::step::{AsyncSpec, Step, StepTarget};
use crate::execution::aggregate::{club_responses, Clubbed};
use crate::execution::async_bridge::{AsyncBridge, Deferral};
use crate::execution::engine::{EventBus, ExecutionEvent};
use crate::execution::scheduler::{ExecutionScheduler, Job, SchedulingStrategy};
use crate::execution::transform::Transformer;
use crate::http::{HttpRequest, HttpResponse};
use crate::template::TemplateEvaluator;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one step invocation (or of a whole branch below it)
#[derive(Debug, Clone)]
pub struct StepRun {
    /// `None` when the branch contributes nothing (e.g. a silent STOP)
    pub response: Option<HttpResponse>,
    pub vars: TemplateVars,
    pub state: StepState,
}

/// Per-request state shared by every step of one pipeline run
#[derive(Clone)]
pub struct Invocation {
    pub id: Uuid,
    pub cancel: CancellationToken,
    /// The original inbound request
    pub request: Arc<HttpRequest>,
    pub scopes: StepScopes,
    pub pipeline: Arc<Pipeline>,
    /// Step being resumed from the async queue; it must not defer again
    pub resumed_step: Option<String>,
    pub correlation_id: Option<String>,
}

/// A built request and, for backend steps, where it goes
struct Outbound {
    request: HttpRequest,
    target: Option<ResolvedTarget>,
}

/// Synthetic 200 answer carrying a rendered message
fn message_response(body: Bytes) -> HttpResponse {
    let content_type = if serde_json::from_slice::<Value>(&body).is_ok() {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    HttpResponse::new(StatusCode::OK, headers, body)
}

pub struct StepExecutor {
    registry: Arc<PipelineRegistry>,
    backend: Arc<dyn RouteExecutor>,
    evaluator: Arc<dyn TemplateEvaluator>,
    bridge: Arc<AsyncBridge>,
    events: EventBus,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        backend: Arc<dyn RouteExecutor>,
        evaluator: Arc<dyn TemplateEvaluator>,
        bridge: Arc<AsyncBridge>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            backend,
            evaluator,
            bridge,
            events,
        }
    }

    fn transformer(&self) -> Transformer<'_> {
        Transformer::new(self.evaluator.as_ref(), self.registry.settings())
    }

    /// Run one step and everything below it
    pub fn run_step(
        self: Arc<Self>,
        inv: Invocation,
        step: Step,
        parent: Option<TemplateVars>,
    ) -> BoxFuture<'static, Result<StepRun>> {
        async move {
            let pipeline_name = inv.pipeline.name.clone();
            self.events.emit(ExecutionEvent::StepStarted {
                pipeline_name: pipeline_name.clone(),
                step_key: step.key.clone(),
            });

            let result = self.drive(&inv, &step, parent).await;

            match &result {
                Ok(run) if run.state == StepState::Done => {
                    self.events.emit(ExecutionEvent::StepCompleted {
                        pipeline_name,
                        step_key: step.key.clone(),
                        status: run.response.as_ref().map(|r| r.status.as_u16()),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Step {} failed: {}", step.key, e);
                    self.events.emit(ExecutionEvent::StepFailed {
                        pipeline_name,
                        step_key: step.key.clone(),
                        error: e.to_string(),
                    });
                }
            }
            result
        }
        .boxed()
    }

    /// Run a set of sibling steps concurrently and club their results
    pub async fn run_siblings(
        self: Arc<Self>,
        inv: Invocation,
        steps: Vec<Step>,
        parent: Option<TemplateVars>,
    ) -> Result<Clubbed> {
        let strategy = SchedulingStrategy::LimitedParallel(self.registry.settings().thread_count);
        let jobs: Vec<Job<StepRun>> = steps
            .into_iter()
            .map(|step| self.clone().run_step(inv.clone(), step, parent.clone()))
            .collect();
        let results = ExecutionScheduler::new(strategy, inv.cancel.clone())
            .run_all(jobs)
            .await;
        club_responses(results)
    }

    async fn drive(
        self: &Arc<Self>,
        inv: &Invocation,
        step: &Step,
        parent: Option<TemplateVars>,
    ) -> Result<StepRun> {
        if step.delay_ms > 0 {
            tokio::select! {
                _ = inv.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(step.delay_ms)) => {}
            }
        }
        if inv.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let transformer = self.transformer();
        let mut vars = transformer.load_scope(&inv.request, parent.as_ref());

        let loop_values = transformer.loop_values(step, &vars, &inv.scopes.snapshot())?;
        if let Some(values) = &loop_values {
            vars.loop_vars = Value::Array(values.clone());
        }

        // Loop iterations shape their own requests from the untransformed scope
        let scope = vars.clone();
        let outbound = self.prepare(inv, step, &mut vars)?;
        let maps = inv.scopes.snapshot();

        if let Some(condition) = &step.condition {
            let rendered = transformer.render_condition(step, &condition.expression, &vars, &maps)?;
            match condition.resolve(&rendered, step.has_children()) {
                ConditionOutcome::Proceed => {}
                ConditionOutcome::Stop => {
                    let response = match &condition.fail_message {
                        Some(message) => transformer
                            .render_message(&format!("{}.condition_fail_message", step.key), message, &vars, &maps)?
                            .map(message_response),
                        None => None,
                    };
                    self.skipped(inv, step, "condition is false");
                    return Ok(StepRun {
                        response,
                        vars,
                        state: StepState::Stopped {
                            reason: "condition".to_string(),
                        },
                    });
                }
                ConditionOutcome::Fail => {
                    let message = match &condition.fail_message {
                        Some(message) => transformer
                            .render_message(&format!("{}.condition_fail_message", step.key), message, &vars, &maps)?
                            .map(|b| String::from_utf8_lossy(&b).into_owned()),
                        None => None,
                    }
                    .unwrap_or_else(|| format!("condition failed for step {}", step.key));
                    return Err(ExecutionError::ConditionFailed { message });
                }
                ConditionOutcome::SkipToChildren => {
                    self.skipped(inv, step, "condition is false, visiting children");
                    inv.scopes.publish_request(&step.scope_keys(), &scope);
                    let children = self.run_children(inv, step, &scope).await?;
                    return Ok(StepRun {
                        response: children.response,
                        vars: children.vars.unwrap_or(scope),
                        state: StepState::Skipped,
                    });
                }
            }
        }

        if let Some(spec) = &step.async_spec {
            if step.loop_spec.is_none() && inv.resumed_step.as_deref() != Some(step.key.as_str()) {
                let placeholder = transformer
                    .render_message(&format!("{}.async_message", step.key), &spec.message, &vars, &maps)?
                    .filter(|body| !body.is_empty());
                match placeholder {
                    Some(placeholder) => return self.defer(inv, step, spec, placeholder, vars, parent).await,
                    None => debug!("Step {} async message is empty, running synchronously", step.key),
                }
            }
        }

        inv.scopes.publish_request(&step.scope_keys(), &vars);

        match loop_values {
            Some(values) if !values.is_empty() => self.run_loop(inv, step, scope, values).await,
            _ => {
                self.clone()
                    .run_iteration(inv.clone(), step.clone(), vars, Some(outbound))
                    .await
            }
        }
    }

    /// Build the outbound request for one execution unit, and resolve its
    /// backend target unless the step runs a nested pipeline
    fn prepare(&self, inv: &Invocation, step: &Step, vars: &mut TemplateVars) -> Result<Outbound> {
        let mut target = match &step.target {
            StepTarget::Pipeline { .. } => None,
            _ => Some(ResolvedTarget::for_step(step, &self.registry)?.ok_or_else(|| {
                ExecutionError::Validation(format!("step {} has no backend target", step.key))
            })?),
        };
        let request = self.transformer().build_request(
            step,
            &inv.request,
            vars,
            &inv.scopes.snapshot(),
            target.as_mut(),
        )?;
        Ok(Outbound { request, target })
    }

    fn skipped(&self, inv: &Invocation, step: &Step, reason: &str) {
        debug!("Step {} skipped: {}", step.key, reason);
        self.events.emit(ExecutionEvent::StepSkipped {
            pipeline_name: inv.pipeline.name.clone(),
            step_key: step.key.clone(),
            reason: reason.to_string(),
        });
    }

    async fn defer(
        &self,
        inv: &Invocation,
        step: &Step,
        spec: &AsyncSpec,
        placeholder: Bytes,
        vars: TemplateVars,
        parent: Option<TemplateVars>,
    ) -> Result<StepRun> {
        let async_id = self
            .bridge
            .defer(Deferral {
                pipeline_name: &inv.pipeline.name,
                step_key: &step.key,
                event_name: spec.event_name.as_deref(),
                request: &inv.request,
                correlation_id: inv.correlation_id.clone(),
                snapshot: ScopeSnapshot {
                    parent,
                    maps: inv.scopes.snapshot(),
                },
            })
            .await?;

        self.events.emit(ExecutionEvent::StepDeferred {
            pipeline_name: inv.pipeline.name.clone(),
            step_key: step.key.clone(),
            async_id: async_id.clone(),
        });

        Ok(StepRun {
            response: Some(message_response(placeholder)),
            vars,
            state: StepState::Deferred { async_id },
        })
    }

    async fn run_loop(
        self: &Arc<Self>,
        inv: &Invocation,
        step: &Step,
        scope: TemplateVars,
        values: Vec<Value>,
    ) -> Result<StepRun> {
        let settings = self.registry.settings();
        let strategy = match &step.loop_spec {
            Some(spec) if spec.in_parallel => {
                SchedulingStrategy::LimitedParallel(settings.loop_thread_count)
            }
            _ => SchedulingStrategy::Sequential,
        };
        debug!("Step {} looping over {} items ({:?})", step.key, values.len(), strategy);

        let jobs: Vec<Job<StepRun>> = values
            .into_iter()
            .map(|value| {
                self.clone()
                    .run_iteration(inv.clone(), step.clone(), scope.for_iteration(value), None)
                    .boxed()
            })
            .collect();
        let results = ExecutionScheduler::new(strategy, inv.cancel.clone())
            .run_all(jobs)
            .await;

        let clubbed = club_responses(results)?;
        let merged = clubbed.vars.unwrap_or(scope);
        inv.scopes.publish_response(&step.scope_keys(), &merged);
        Ok(StepRun {
            response: clubbed.response,
            vars: merged,
            state: StepState::Done,
        })
    }

    /// One execution unit: call the target, reshape, then visit children.
    ///
    /// Loop iterations arrive without an outbound request and build their own.
    async fn run_iteration(
        self: Arc<Self>,
        inv: Invocation,
        step: Step,
        mut vars: TemplateVars,
        outbound: Option<Outbound>,
    ) -> Result<StepRun> {
        let outbound = match outbound {
            Some(outbound) => outbound,
            None => {
                let outbound = self.prepare(&inv, &step, &mut vars)?;
                inv.scopes.publish_request(&step.scope_keys(), &vars);
                outbound
            }
        };

        let response = match (&step.target, outbound.target) {
            (StepTarget::Pipeline { function_name }, _) => {
                let nested = self
                    .registry
                    .pipeline(function_name)
                    .ok_or_else(|| ExecutionError::PipelineNotFound(function_name.clone()))?;
                let nested_inv = Invocation {
                    request: Arc::new(outbound.request),
                    pipeline: nested.clone(),
                    resumed_step: None,
                    ..inv.clone()
                };
                let roots: Vec<Step> = nested.steps.values().cloned().collect();
                let clubbed = self
                    .clone()
                    .run_siblings(nested_inv, roots, Some(vars.clone()))
                    .await?;
                clubbed.response.unwrap_or_else(HttpResponse::empty_json)
            }
            (_, Some(target)) => self.call(&inv, &step, outbound.request, &target).await?,
            (_, None) => {
                return Err(ExecutionError::Validation(format!(
                    "step {} has no backend target",
                    step.key
                )))
            }
        };

        let maps = inv.scopes.snapshot();
        let response = self
            .transformer()
            .transform_response(&step, response, &mut vars, &maps)?;
        inv.scopes.publish_response(&step.scope_keys(), &vars);

        if step.has_children() {
            let children = self.run_children(&inv, &step, &vars).await?;
            if let Some(response) = children.response {
                return Ok(StepRun {
                    response: Some(response),
                    vars: children.vars.unwrap_or(vars),
                    state: StepState::Done,
                });
            }
        }

        Ok(StepRun {
            response: Some(response),
            vars,
            state: StepState::Done,
        })
    }

    /// Backend call with timeout, cancellation and the route's error policy
    async fn call(
        &self,
        inv: &Invocation,
        step: &Step,
        request: HttpRequest,
        target: &ResolvedTarget,
    ) -> Result<HttpResponse> {
        let outcome = tokio::select! {
            _ = inv.cancel.cancelled() => Err(BackendError::Cancelled),
            result = tokio::time::timeout(target.timeout, self.backend.execute(&inv.cancel, request, target)) => {
                result.unwrap_or(Err(BackendError::Timeout(target.timeout.as_secs())))
            }
        };

        let (message, response) = match outcome {
            Ok(response) if !response.is_error() => return Ok(response),
            Ok(response) => (
                format!("{} answered {}", target.name, response.status),
                Some(response),
            ),
            Err(BackendError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(e) => (format!("{}: {}", target.name, e), None),
        };

        match target.on_error {
            OnErrorPolicy::Stop => Err(ExecutionError::Backend { message, response }),
            OnErrorPolicy::Ignore => {
                warn!("Step {} ignoring backend error: {}", step.key, message);
                Ok(HttpResponse::empty_json())
            }
        }
    }

    async fn run_children(
        self: &Arc<Self>,
        inv: &Invocation,
        step: &Step,
        vars: &TemplateVars,
    ) -> Result<Clubbed> {
        let children: Vec<Step> = step.children.values().cloned().collect();
        self.clone()
            .run_siblings(inv.clone(), children, Some(vars.clone()))
            .await
    }
}
