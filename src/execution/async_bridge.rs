//! Hand-off of deferred steps to a queue, and loading them back

use crate::core::context::ScopeSnapshot;
use crate::core::error::ExecutionError;
use crate::core::state::AsyncStatus;
use crate::http::{HttpRequest, HttpResponse};
use crate::persistence::{AsyncRecord, AsyncStore, QueueRegistry};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What a deferred step leaves behind
pub struct Deferral<'a> {
    pub pipeline_name: &'a str,
    pub step_key: &'a str,
    pub event_name: Option<&'a str>,
    /// The original inbound request, not the step's outbound one
    pub request: &'a HttpRequest,
    pub correlation_id: Option<String>,
    pub snapshot: ScopeSnapshot,
}

/// A row looked up for resumption
#[derive(Debug)]
pub enum Resumable {
    Ready {
        record: AsyncRecord,
        request: HttpRequest,
        snapshot: ScopeSnapshot,
    },
    /// Already left `PENDING`; nothing to do
    Duplicate(AsyncStatus),
    /// Missing or undecodable; the row (if any) is now `FAILED`
    Failed(String),
}

/// Result of one resumption attempt
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    Processed(HttpResponse),
    Failed(String),
    Duplicate(AsyncStatus),
}

impl ResumeOutcome {
    pub fn status(&self) -> AsyncStatus {
        match self {
            ResumeOutcome::Processed(_) => AsyncStatus::Processed,
            ResumeOutcome::Failed(_) => AsyncStatus::Failed,
            ResumeOutcome::Duplicate(status) => *status,
        }
    }
}

pub struct AsyncBridge {
    store: Arc<dyn AsyncStore>,
    queues: QueueRegistry,
}

impl AsyncBridge {
    pub fn new(store: Arc<dyn AsyncStore>, queues: QueueRegistry) -> Self {
        Self { store, queues }
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    /// Persist resumption state and publish its id.
    ///
    /// The row is written before the id is published so a consumer never
    /// sees an id without a row. A failed publish marks the row `FAILED`.
    pub async fn defer(&self, deferral: Deferral<'_>) -> Result<String, ExecutionError> {
        let queue = self.queues.resolve(deferral.event_name).ok_or_else(|| {
            ExecutionError::AsyncPersistence(format!(
                "no queue for event '{}'",
                deferral.event_name.unwrap_or("<default>")
            ))
        })?;

        let async_id = Uuid::new_v4().to_string();
        let scope_json = serde_json::to_string(&deferral.snapshot)
            .map_err(|e| ExecutionError::AsyncPersistence(e.to_string()))?;
        let record = AsyncRecord::new(
            async_id.clone(),
            deferral.pipeline_name.to_string(),
            deferral.step_key.to_string(),
            scope_json,
            deferral.request.to_wire(),
            deferral.correlation_id,
        );

        self.store
            .insert(&record)
            .await
            .map_err(|e| ExecutionError::AsyncPersistence(format!("{:#}", e)))?;

        if let Err(e) = queue.publish(&async_id).await {
            let reason = json!({ "error": format!("publish failed: {:#}", e) }).to_string();
            if let Err(mark) = self
                .store
                .update_status(&async_id, AsyncStatus::Failed, Some(reason))
                .await
            {
                warn!("Could not mark {} as failed: {:#}", async_id, mark);
            }
            return Err(ExecutionError::AsyncPersistence(format!(
                "publish to '{}' failed: {:#}",
                queue.name(),
                e
            )));
        }

        info!(
            "Deferred step {} of {} as {} on queue {}",
            deferral.step_key,
            deferral.pipeline_name,
            async_id,
            queue.name()
        );
        Ok(async_id)
    }

    /// Look up a row for resumption
    pub async fn load(&self, async_id: &str) -> Result<Resumable> {
        let Some(record) = self.store.fetch(async_id, Some(AsyncStatus::Pending)).await? else {
            return Ok(match self.store.fetch(async_id, None).await? {
                Some(record) => Resumable::Duplicate(record.status),
                None => Resumable::Failed(format!("no async request '{}'", async_id)),
            });
        };

        let decoded = HttpRequest::from_wire(&record.request_b64).and_then(|request| {
            let snapshot: ScopeSnapshot = serde_json::from_str(&record.scope_json)?;
            Ok((request, snapshot))
        });

        match decoded {
            Ok((request, snapshot)) => Ok(Resumable::Ready {
                record,
                request,
                snapshot,
            }),
            Err(e) => {
                let message = format!("cannot decode async request '{}': {:#}", async_id, e);
                self.store
                    .update_status(
                        async_id,
                        AsyncStatus::Failed,
                        Some(json!({ "error": message }).to_string()),
                    )
                    .await?;
                Ok(Resumable::Failed(message))
            }
        }
    }

    /// Record the outcome of a resumed run
    pub async fn complete(
        &self,
        async_id: &str,
        result: &Result<HttpResponse, ExecutionError>,
    ) -> Result<ResumeOutcome> {
        let (status, result_json, outcome) = match result {
            Ok(response) => (
                AsyncStatus::Processed,
                response.to_json().to_string(),
                ResumeOutcome::Processed(response.clone()),
            ),
            Err(e) => (
                AsyncStatus::Failed,
                json!({ "error": e.to_string() }).to_string(),
                ResumeOutcome::Failed(e.to_string()),
            ),
        };

        if !self
            .store
            .update_status(async_id, status, Some(result_json))
            .await?
        {
            // Another consumer finished first
            if let Some(record) = self.store.fetch(async_id, None).await? {
                return Ok(ResumeOutcome::Duplicate(record.status));
            }
        }
        Ok(outcome)
    }
}
