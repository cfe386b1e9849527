// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed task store.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations;

use super::{TaskLogRecord, TaskRecord, TaskStore};

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases get a single connection so every query sees the
    /// same database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates missing parent directories and the database file, then runs
    /// migrations.
    ///
    /// ```ignore
    /// let store = SqliteTaskStore::from_path(".data/dispatch.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn record_terminal(&self, record: &TaskRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_records
                (task_id, task_kind, status, payload, outcome, error_code, error_message,
                 submitted_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.task_kind)
        .bind(&record.status)
        .bind(&record.payload)
        .bind(&record.outcome)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(record.submitted_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT task_id, task_kind, status, payload, outcome, error_code, error_message,
                   submitted_at, finished_at
            FROM task_records
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<TaskRecord>, CoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT task_id, task_kind, status, payload, outcome, error_code, error_message,
                   submitted_at, finished_at
            FROM task_records
            ORDER BY finished_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn append_log(&self, entry: &TaskLogRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_logs
                (correlation_id, queue_name, service_name, task_kind, status, description,
                 created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.correlation_id)
        .bind(&entry.queue_name)
        .bind(&entry.service_name)
        .bind(&entry.task_kind)
        .bind(&entry.status)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn logs_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<TaskLogRecord>, CoreError> {
        let rows = sqlx::query_as::<_, TaskLogRecord>(
            r#"
            SELECT correlation_id, queue_name, service_name, task_kind, status, description,
                   created_at
            FROM task_logs
            WHERE correlation_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
