//! Main execution engine - entry point for pipeline invocations, async
//! resumption and queue consumption

use crate::backend::RouteExecutor;
use crate::core::context::{ScopeMaps, StepScopes, TemplateVars};
use crate::core::error::{ExecutionError, Result};
use crate::core::pipeline::PipelineRegistry;
use crate::core::step::Step;
use crate::execution::async_bridge::{AsyncBridge, Resumable, ResumeOutcome};
use crate::execution::executor::{Invocation, StepExecutor};
use crate::http::{HttpRequest, HttpResponse};
use crate::persistence::{AsyncStore, QueueRegistry};
use crate::template::{HandlebarsEvaluator, TemplateEvaluator};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_name: String,
        invocation_id: Uuid,
    },
    StepStarted {
        pipeline_name: String,
        step_key: String,
    },
    StepSkipped {
        pipeline_name: String,
        step_key: String,
        reason: String,
    },
    StepDeferred {
        pipeline_name: String,
        step_key: String,
        async_id: String,
    },
    StepCompleted {
        pipeline_name: String,
        step_key: String,
        status: Option<u16>,
    },
    StepFailed {
        pipeline_name: String,
        step_key: String,
        error: String,
    },
    PipelineCompleted {
        pipeline_name: String,
        invocation_id: Uuid,
        status: u16,
        success: bool,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().push(handler);
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

/// What one successful invocation leaves behind
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub response: HttpResponse,
    /// Scope of the branch that produced the response
    pub vars: Option<TemplateVars>,
    /// Final request/response scopes of every step that ran
    pub scopes: ScopeMaps,
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    registry: Arc<PipelineRegistry>,
    backend: Arc<dyn RouteExecutor>,
    evaluator: Arc<dyn TemplateEvaluator>,
    bridge: Arc<AsyncBridge>,
    events: EventBus,
}

impl ExecutionEngine {
    pub fn new(
        registry: PipelineRegistry,
        backend: Arc<dyn RouteExecutor>,
        store: Arc<dyn AsyncStore>,
        queues: QueueRegistry,
    ) -> Self {
        let queues = match queues.default_name() {
            Some(_) => queues,
            None => {
                let default_queue = registry.settings().default_queue.clone();
                queues.with_default(default_queue)
            }
        };

        Self {
            registry: Arc::new(registry),
            backend,
            evaluator: Arc::new(HandlebarsEvaluator::new()),
            bridge: Arc::new(AsyncBridge::new(store, queues)),
            events: EventBus::default(),
        }
    }

    /// Swap the template evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn TemplateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Arc::new(handler));
    }

    fn executor(&self) -> Arc<StepExecutor> {
        Arc::new(StepExecutor::new(
            self.registry.clone(),
            self.backend.clone(),
            self.evaluator.clone(),
            self.bridge.clone(),
            self.events.clone(),
        ))
    }

    /// Run a pipeline for one inbound request.
    ///
    /// With `step` set only that step (and its children) runs, as if it
    /// were the pipeline's single entry point.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        request: HttpRequest,
        pipeline_name: &str,
        step: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let pipeline = self
            .registry
            .pipeline(pipeline_name)
            .ok_or_else(|| ExecutionError::PipelineNotFound(pipeline_name.to_string()))?;

        let roots: Vec<Step> = match step {
            Some(key) => vec![pipeline
                .step(key)
                .cloned()
                .ok_or_else(|| ExecutionError::StepNotFound(key.to_string()))?],
            None => pipeline.steps.values().cloned().collect(),
        };

        let correlation_id = request
            .header(&self.registry.settings().correlation_header)
            .map(str::to_string);
        let inv = Invocation {
            id: Uuid::new_v4(),
            cancel,
            request: Arc::new(request),
            scopes: StepScopes::new(),
            pipeline: pipeline.clone(),
            resumed_step: None,
            correlation_id,
        };

        info!(
            "Starting pipeline {} ({}) with {} root step(s)",
            pipeline.name,
            inv.id,
            roots.len()
        );
        self.events.emit(ExecutionEvent::PipelineStarted {
            pipeline_name: pipeline.name.clone(),
            invocation_id: inv.id,
        });

        let result = self
            .executor()
            .run_siblings(inv.clone(), roots, None)
            .await
            .map(|clubbed| ExecutionOutcome {
                response: clubbed.response.unwrap_or_else(HttpResponse::empty_json),
                vars: clubbed.vars,
                scopes: inv.scopes.snapshot(),
            });

        let (status, success) = match &result {
            Ok(outcome) => (outcome.response.status.as_u16(), true),
            Err(e) => {
                error!("Pipeline {} ({}) failed: {}", pipeline.name, inv.id, e);
                (e.to_response(pipeline.response_status_code).status.as_u16(), false)
            }
        };
        info!("Pipeline {} ({}) finished with {}", pipeline.name, inv.id, status);
        self.events.emit(ExecutionEvent::PipelineCompleted {
            pipeline_name: pipeline.name.clone(),
            invocation_id: inv.id,
            status,
            success,
        });

        result
    }

    /// Like [`execute`](Self::execute), with errors rendered as the
    /// response the caller sees
    pub async fn respond(
        &self,
        cancel: CancellationToken,
        request: HttpRequest,
        pipeline_name: &str,
        step: Option<&str>,
    ) -> HttpResponse {
        let status_override = self
            .registry
            .pipeline(pipeline_name)
            .and_then(|p| p.response_status_code);
        match self.execute(cancel, request, pipeline_name, step).await {
            Ok(outcome) => outcome.response,
            Err(e) => e.to_response(status_override),
        }
    }

    /// Resume a deferred step by its async id.
    ///
    /// A row that already left `PENDING` is reported as a duplicate and not
    /// run again.
    pub async fn resume(
        &self,
        cancel: CancellationToken,
        async_id: &str,
    ) -> anyhow::Result<ResumeOutcome> {
        let (record, request, snapshot) = match self.bridge.load(async_id).await? {
            Resumable::Ready {
                record,
                request,
                snapshot,
            } => (record, request, snapshot),
            Resumable::Duplicate(status) => {
                info!("Async request {} already {}", async_id, status.as_str());
                return Ok(ResumeOutcome::Duplicate(status));
            }
            Resumable::Failed(reason) => {
                warn!("Async request {} cannot be resumed: {}", async_id, reason);
                return Ok(ResumeOutcome::Failed(reason));
            }
        };

        info!(
            "Resuming step {} of {} ({})",
            record.step_key, record.pipeline_name, async_id
        );

        let result = self
            .resume_step(cancel, request, &record.pipeline_name, &record.step_key, snapshot)
            .await;
        self.bridge.complete(async_id, &result).await
    }

    async fn resume_step(
        &self,
        cancel: CancellationToken,
        request: HttpRequest,
        pipeline_name: &str,
        step_key: &str,
        snapshot: crate::core::context::ScopeSnapshot,
    ) -> Result<HttpResponse> {
        let pipeline = self
            .registry
            .pipeline(pipeline_name)
            .ok_or_else(|| ExecutionError::PipelineNotFound(pipeline_name.to_string()))?;
        let step = pipeline
            .step(step_key)
            .cloned()
            .ok_or_else(|| ExecutionError::StepNotFound(step_key.to_string()))?;

        let correlation_id = request
            .header(&self.registry.settings().correlation_header)
            .map(str::to_string);
        let inv = Invocation {
            id: Uuid::new_v4(),
            cancel,
            request: Arc::new(request),
            scopes: StepScopes::from_maps(snapshot.maps),
            pipeline,
            resumed_step: Some(step_key.to_string()),
            correlation_id,
        };

        let run = self.executor().run_step(inv, step, snapshot.parent).await?;
        Ok(run.response.unwrap_or_else(HttpResponse::empty_json))
    }

    /// Poll a queue once and resume every received async id.
    ///
    /// Messages are deleted once their outcome is recorded; a message whose
    /// resumption errored stays on the queue for redelivery.
    pub async fn consume(
        &self,
        cancel: CancellationToken,
        queue: Option<&str>,
        max: usize,
    ) -> anyhow::Result<Vec<(String, ResumeOutcome)>> {
        let queues = self.bridge.queues();
        let queue = match queue {
            Some(name) => queues.get(name),
            None => queues.resolve(None),
        }
        .ok_or_else(|| anyhow::anyhow!("No queue '{}'", queue.unwrap_or("<default>")))?;

        let messages = queue.poll(max).await?;
        info!("Received {} message(s) from {}", messages.len(), queue.name());

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            if cancel.is_cancelled() {
                break;
            }
            match self.resume(cancel.clone(), &message.body).await {
                Ok(outcome) => {
                    queue.delete_message(&message.delete_handle).await?;
                    outcomes.push((message.body, outcome));
                }
                Err(e) => {
                    warn!("Resuming {} failed, leaving it queued: {:#}", message.body, e);
                }
            }
        }
        Ok(outcomes)
    }
}
