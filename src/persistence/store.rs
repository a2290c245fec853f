//! SQLite-based resumption store and queue

use crate::persistence::{AsyncRecord, AsyncStatus, AsyncStore, MessageQueue, QueueMessage};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

/// Convert DateTime<Utc> to NaiveDateTime for SQLite
fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

/// Convert NaiveDateTime to DateTime<Utc>
fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

/// SQLite resumption store
#[derive(Clone)]
pub struct SqliteAsyncStore {
    pool: SqlitePool,
}

impl SqliteAsyncStore {
    /// Open (creating if needed) a database file
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", db_path))?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        Self::from_pool(pool).await
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("funcflow");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("async.db");
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?;
        Self::new(db_path).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// The pool, for queues sharing this database
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS async_requests (
                async_id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                step_key TEXT NOT NULL,
                scope_json TEXT NOT NULL,
                request_b64 TEXT NOT NULL,
                correlation_id TEXT,
                status TEXT NOT NULL,
                result_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_async_status ON async_requests(status);

            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages(queue, visible_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<AsyncRecord> {
        let status: String = row.get("status");
        Ok(AsyncRecord {
            async_id: row.get("async_id"),
            pipeline_name: row.get("pipeline_name"),
            step_key: row.get("step_key"),
            scope_json: row.get("scope_json"),
            request_b64: row.get("request_b64"),
            correlation_id: row.get("correlation_id"),
            status: status.parse::<AsyncStatus>().map_err(anyhow::Error::msg)?,
            result_json: row.get("result_json"),
            created_at: from_naive(row.get("created_at")),
            updated_at: from_naive(row.get("updated_at")),
        })
    }
}

#[async_trait::async_trait]
impl AsyncStore for SqliteAsyncStore {
    async fn insert(&self, record: &AsyncRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO async_requests
            (async_id, pipeline_name, step_key, scope_json, request_b64, correlation_id, status, result_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.async_id)
        .bind(&record.pipeline_name)
        .bind(&record.step_key)
        .bind(&record.scope_json)
        .bind(&record.request_b64)
        .bind(&record.correlation_id)
        .bind(record.status.as_str())
        .bind(&record.result_json)
        .bind(to_naive(record.created_at))
        .bind(to_naive(record.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert async request")?;

        Ok(())
    }

    async fn fetch(
        &self,
        async_id: &str,
        status: Option<AsyncStatus>,
    ) -> Result<Option<AsyncRecord>> {
        let row = sqlx::query(
            r#"
            SELECT async_id, pipeline_name, step_key, scope_json, request_b64, correlation_id, status, result_json, created_at, updated_at
            FROM async_requests
            WHERE async_id = ?1 AND (?2 IS NULL OR status = ?2)
            "#,
        )
        .bind(async_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load async request")?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_status(
        &self,
        async_id: &str,
        status: AsyncStatus,
        result_json: Option<String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE async_requests
            SET status = ?1, result_json = ?2, updated_at = ?3
            WHERE async_id = ?4 AND status = 'PENDING'
            "#,
        )
        .bind(status.as_str())
        .bind(result_json)
        .bind(to_naive(Utc::now()))
        .bind(async_id)
        .execute(&self.pool)
        .await
        .context("Failed to update async request")?;

        Ok(result.rows_affected() > 0)
    }
}

/// SQLite-backed queue sharing the store's database
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    name: String,
    visibility: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, name: &str, visibility: Duration) -> Self {
        Self {
            pool,
            name: name.to_string(),
            visibility,
        }
    }
}

#[async_trait::async_trait]
impl MessageQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = to_naive(Utc::now());
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, body, visible_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(&self.name)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to publish message")?;

        Ok(id)
    }

    async fn poll(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let hidden_until = now
            + chrono::Duration::from_std(self.visibility).unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut tx = self.pool.begin().await.context("Failed to begin poll")?;
        let rows = sqlx::query(
            r#"
            SELECT id, body FROM queue_messages
            WHERE queue = ?1 AND visible_at <= ?2
            ORDER BY created_at ASC
            LIMIT ?3
            "#,
        )
        .bind(&self.name)
        .bind(to_naive(now))
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to poll queue")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            sqlx::query("UPDATE queue_messages SET visible_at = ?1 WHERE id = ?2")
                .bind(to_naive(hidden_until))
                .bind(&id)
                .execute(&mut *tx)
                .await
                .context("Failed to hide polled message")?;
            messages.push(QueueMessage {
                body: row.get("body"),
                delete_handle: id,
            });
        }
        tx.commit().await.context("Failed to commit poll")?;

        Ok(messages)
    }

    async fn delete_message(&self, delete_handle: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?1")
            .bind(delete_handle)
            .execute(&self.pool)
            .await
            .context("Failed to delete message")?;

        Ok(())
    }
}
