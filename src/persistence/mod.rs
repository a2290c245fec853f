//! Persistence for async resumption state and the queues that carry it

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::{SqliteAsyncStore, SqliteQueue};

pub use crate::core::AsyncStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long a polled message stays hidden before it is redelivered
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to resume a deferred step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncRecord {
    /// Generated id, also the queue message body
    pub async_id: String,

    pub pipeline_name: String,

    /// Step to resume from
    pub step_key: String,

    /// Serialized `ScopeSnapshot`
    pub scope_json: String,

    /// The original inbound request, wire-encoded
    pub request_b64: String,

    pub correlation_id: Option<String>,

    pub status: AsyncStatus,

    /// Final response once processed
    pub result_json: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncRecord {
    pub fn new(
        async_id: String,
        pipeline_name: String,
        step_key: String,
        scope_json: String,
        request_b64: String,
        correlation_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            async_id,
            pipeline_name,
            step_key,
            scope_json,
            request_b64,
            correlation_id,
            status: AsyncStatus::Pending,
            result_json: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trait for resumption-state backends
#[async_trait::async_trait]
pub trait AsyncStore: Send + Sync {
    /// Persist a new row
    async fn insert(&self, record: &AsyncRecord) -> Result<()>;

    /// Load a row, optionally only if it has the given status
    async fn fetch(&self, async_id: &str, status: Option<AsyncStatus>)
        -> Result<Option<AsyncRecord>>;

    /// Move a `PENDING` row to `status`.
    ///
    /// Returns `false` when the row is missing or already left `PENDING`.
    async fn update_status(
        &self,
        async_id: &str,
        status: AsyncStatus,
        result_json: Option<String>,
    ) -> Result<bool>;
}

/// In-memory resumption store (for testing or ephemeral use)
pub struct InMemoryAsyncStore {
    rows: tokio::sync::RwLock<HashMap<String, AsyncRecord>>,
}

impl InMemoryAsyncStore {
    pub fn new() -> Self {
        Self {
            rows: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Every stored row, oldest first
    pub async fn records(&self) -> Vec<AsyncRecord> {
        let mut rows: Vec<AsyncRecord> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }
}

impl Default for InMemoryAsyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AsyncStore for InMemoryAsyncStore {
    async fn insert(&self, record: &AsyncRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.async_id) {
            anyhow::bail!("async id '{}' already exists", record.async_id);
        }
        rows.insert(record.async_id.clone(), record.clone());
        Ok(())
    }

    async fn fetch(
        &self,
        async_id: &str,
        status: Option<AsyncStatus>,
    ) -> Result<Option<AsyncRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(async_id)
            .filter(|row| status.map_or(true, |s| row.status == s))
            .cloned())
    }

    async fn update_status(
        &self,
        async_id: &str,
        status: AsyncStatus,
        result_json: Option<String>,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(async_id) {
            Some(row) if row.status == AsyncStatus::Pending => {
                row.status = status;
                row.result_json = result_json;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A polled queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub delete_handle: String,
}

/// Trait for async hand-off queues (at-least-once)
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a message, returning its id
    async fn publish(&self, body: &str) -> Result<String>;

    /// Receive up to `max` visible messages; they stay hidden until the
    /// visibility timeout passes or they are deleted
    async fn poll(&self, max: usize) -> Result<Vec<QueueMessage>>;

    async fn delete_message(&self, delete_handle: &str) -> Result<()>;
}

struct QueuedMessage {
    id: String,
    body: String,
    hidden_until: Option<Instant>,
}

/// In-memory queue with a visibility timeout
pub struct InMemoryQueue {
    name: String,
    visibility: Duration,
    messages: tokio::sync::Mutex<VecDeque<QueuedMessage>>,
}

impl InMemoryQueue {
    pub fn new(name: &str) -> Self {
        Self::with_visibility(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility(name: &str, visibility: Duration) -> Self {
        Self {
            name: name.to_string(),
            visibility,
            messages: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Messages not yet deleted, visible or not
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait::async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.messages.lock().await.push_back(QueuedMessage {
            id: id.clone(),
            body: body.to_string(),
            hidden_until: None,
        });
        Ok(id)
    }

    async fn poll(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut messages = self.messages.lock().await;
        let mut received = Vec::new();
        for message in messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.hidden_until.map_or(true, |until| until <= now) {
                message.hidden_until = Some(now + self.visibility);
                received.push(QueueMessage {
                    body: message.body.clone(),
                    delete_handle: message.id.clone(),
                });
            }
        }
        Ok(received)
    }

    async fn delete_message(&self, delete_handle: &str) -> Result<()> {
        self.messages
            .lock()
            .await
            .retain(|message| message.id != delete_handle);
        Ok(())
    }
}

/// Maps `async_event_name` to a queue
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, Arc<dyn MessageQueue>>,
    default_queue: Option<String>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, queue: Arc<dyn MessageQueue>) {
        self.queues.insert(queue.name().to_string(), queue);
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.register(queue);
        self
    }

    pub fn with_default(mut self, name: Option<String>) -> Self {
        self.default_queue = name;
        self
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_queue.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageQueue>> {
        self.queues.get(name).cloned()
    }

    /// Queue for an event name, falling back to the default queue, then to
    /// the only registered queue
    pub fn resolve(&self, event_name: Option<&str>) -> Option<Arc<dyn MessageQueue>> {
        if let Some(name) = event_name.or(self.default_queue.as_deref()) {
            return self.get(name);
        }
        if self.queues.len() == 1 {
            return self.queues.values().next().cloned();
        }
        None
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }
}
