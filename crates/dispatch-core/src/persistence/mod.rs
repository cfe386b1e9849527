// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for dispatch-core.
//!
//! The task store holds terminal task records and the call event log. Both
//! SQLite and PostgreSQL backends apply their embedded migrations on connect.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::postgres::PostgresTaskStore;
pub use self::sqlite::SqliteTaskStore;

use crate::error::CoreError;

/// Terminal task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
    /// Task identifier (UUID string).
    pub task_id: String,
    /// Task kind the payload was processed with.
    pub task_kind: String,
    /// Terminal status (succeeded, failed).
    pub status: String,
    /// JSON-encoded input payload.
    pub payload: String,
    /// JSON-encoded outcome for succeeded tasks.
    pub outcome: Option<String>,
    /// Error code for failed tasks.
    pub error_code: Option<String>,
    /// Error message for failed tasks.
    pub error_message: Option<String>,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the task reached its terminal status.
    pub finished_at: DateTime<Utc>,
}

/// One row of the call event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskLogRecord {
    /// Correlation token of the call, `-` when unknown.
    pub correlation_id: String,
    /// Work queue involved, if any.
    pub queue_name: Option<String>,
    /// Name of the emitting service.
    pub service_name: String,
    /// Task kind, `-` when unknown.
    pub task_kind: String,
    /// Event name (published, reply_received, timed_out, ...).
    pub status: String,
    /// Free-form detail.
    pub description: Option<String>,
    /// When the event happened.
    pub created_at: DateTime<Utc>,
}

/// Durable storage for task records and the event log.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a terminal record. Returns false, leaving the stored row
    /// untouched, if a record for the task already exists.
    async fn record_terminal(&self, record: &TaskRecord) -> Result<bool, CoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError>;

    /// Most recently finished first.
    async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<TaskRecord>, CoreError>;

    async fn append_log(&self, entry: &TaskLogRecord) -> Result<(), CoreError>;

    /// Log rows for a call, oldest first.
    async fn logs_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<TaskLogRecord>, CoreError>;

    async fn health_check(&self) -> Result<bool, CoreError>;
}

/// Connect to the store named by `database_url` and apply migrations.
///
/// `sqlite:` URLs select the SQLite backend, `postgres://` and
/// `postgresql://` URLs the PostgreSQL backend.
pub async fn connect(database_url: &str) -> Result<Arc<dyn TaskStore>, CoreError> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTaskStore::connect(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        Ok(Arc::new(PostgresTaskStore::connect(database_url).await?))
    } else {
        Err(CoreError::ValidationError {
            field: "database_url".to_string(),
            message: "expected a sqlite: or postgres:// URL".to_string(),
        })
    }
}
