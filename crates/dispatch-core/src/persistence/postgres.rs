// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed task store.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::CoreError;
use crate::migrations;

use super::{TaskLogRecord, TaskRecord, TaskStore};

/// PostgreSQL-backed task store.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TaskStore for PostgresTaskStore {
    async fn record_terminal(&self, record: &TaskRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_records
                (task_id, task_kind, status, payload, outcome, error_code, error_message,
                 submitted_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            WHERE task_id = $1
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
            LIMIT $1 OFFSET $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            WHERE correlation_id = $1
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
