// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request handlers.
//!
//! Transport-agnostic handlers for processing requests. `process` and
//! `process_async` honour an optional idempotency key, scoped per operation so
//! the same key used on both never collides.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::idempotency::{IdempotencyGuard, IdempotentResponse, scoped_key};
use crate::metrics::{MetricsReport, MetricsReporter};
use crate::persistence::{TaskLogRecord, TaskRecord, TaskStore};
use crate::rpc::RpcClient;
use crate::tasks::{TaskId, TaskStatus, TaskTracker};
use crate::transform::DEFAULT_TASK_KIND;

/// Task id reported for synchronous requests, which have none.
pub const SYNC_TASK_ID: &str = "-";

pub const STATUS_PROCESSING: &str = "Processing";
pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILED: &str = "Failed";

/// Idempotency scope of synchronous processing.
pub const SCOPE_PROCESS: &str = "process";
/// Idempotency scope of background processing.
pub const SCOPE_PROCESS_ASYNC: &str = "process-async";

/// Largest page `list_records` returns.
pub const MAX_PAGE_SIZE: i64 = 1000;

fn default_task_kind() -> String {
    DEFAULT_TASK_KIND.to_string()
}

/// A processing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub payload: Value,
    #[serde(default = "default_task_kind")]
    pub task_kind: String,
}

/// Response of `process`, `process_async` and `task_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub task_id: String,
    pub task_status: String,
    pub outcome: Option<Value>,
}

impl ProcessResponse {
    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Shared state for request handlers.
pub struct HandlerState {
    rpc: Arc<RpcClient>,
    tracker: TaskTracker,
    guard: Arc<IdempotencyGuard>,
    store: Arc<dyn TaskStore>,
    metrics: MetricsReporter,
    work_queue: String,
    rpc_timeout: Duration,
}

impl HandlerState {
    pub fn new(
        rpc: Arc<RpcClient>,
        tracker: TaskTracker,
        guard: Arc<IdempotencyGuard>,
        store: Arc<dyn TaskStore>,
        metrics: MetricsReporter,
        work_queue: impl Into<String>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            tracker,
            guard,
            store,
            metrics,
            work_queue: work_queue.into(),
            rpc_timeout,
        }
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn guard(&self) -> &Arc<IdempotencyGuard> {
        &self.guard
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn metrics(&self) -> &MetricsReporter {
        &self.metrics
    }

    pub fn work_queue(&self) -> &str {
        &self.work_queue
    }
}

fn validate(request: &ProcessRequest) -> Result<()> {
    if request.task_kind.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "task_kind".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn parse_task_id(task_id: &str) -> Result<TaskId> {
    task_id
        .trim()
        .parse()
        .map_err(|_| CoreError::ValidationError {
            field: "task_id".to_string(),
            message: format!("'{}' is not a valid task id", task_id),
        })
}

/// Process a payload and wait for the outcome.
#[instrument(skip(state, request), fields(task_kind = %request.task_kind))]
pub async fn handle_process(
    state: &HandlerState,
    idempotency_key: Option<&str>,
    request: ProcessRequest,
) -> Result<IdempotentResponse> {
    validate(&request)?;
    let key = scoped_key(SCOPE_PROCESS, idempotency_key);

    let response = state
        .guard
        .execute(key.as_deref(), move || async move {
            let outcome = state
                .rpc
                .call(
                    &state.work_queue,
                    &request.task_kind,
                    request.payload,
                    state.rpc_timeout,
                )
                .await?;
            ProcessResponse {
                task_id: SYNC_TASK_ID.to_string(),
                task_status: STATUS_SUCCESS.to_string(),
                outcome: Some(outcome),
            }
            .encode()
        })
        .await?;

    debug!(replayed = response.replayed, "Process request handled");
    Ok(response)
}

/// Start processing a payload in the background.
#[instrument(skip(state, request), fields(task_kind = %request.task_kind))]
pub async fn handle_process_async(
    state: &HandlerState,
    idempotency_key: Option<&str>,
    request: ProcessRequest,
) -> Result<IdempotentResponse> {
    validate(&request)?;
    let key = scoped_key(SCOPE_PROCESS_ASYNC, idempotency_key);

    let response = state
        .guard
        .execute(key.as_deref(), move || async move {
            let task_id = state
                .tracker
                .submit(request.payload, &request.task_kind)
                .await?;
            ProcessResponse {
                task_id: task_id.to_string(),
                task_status: STATUS_PROCESSING.to_string(),
                outcome: None,
            }
            .encode()
        })
        .await?;

    debug!(replayed = response.replayed, "Async process request handled");
    Ok(response)
}

/// Current status of a background task.
pub async fn handle_task_status(state: &HandlerState, task_id: &str) -> Result<ProcessResponse> {
    let id = parse_task_id(task_id)?;
    let status = state.tracker.status(&id).await?;

    let (task_status, outcome) = match status {
        TaskStatus::Pending => (STATUS_PROCESSING, None),
        TaskStatus::Succeeded { outcome } => (STATUS_SUCCESS, Some(outcome)),
        TaskStatus::Failed { error } => (
            STATUS_FAILED,
            Some(json!({"error": {"code": error.code, "message": error.message}})),
        ),
    };

    Ok(ProcessResponse {
        task_id: id.to_string(),
        task_status: task_status.to_string(),
        outcome,
    })
}

/// Stored task records, most recently finished first.
pub async fn handle_list_records(
    state: &HandlerState,
    limit: i64,
    offset: i64,
) -> Result<Vec<TaskRecord>> {
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(CoreError::ValidationError {
            field: "limit".to_string(),
            message: format!("must be between 1 and {}", MAX_PAGE_SIZE),
        });
    }
    if offset < 0 {
        return Err(CoreError::ValidationError {
            field: "offset".to_string(),
            message: "must not be negative".to_string(),
        });
    }
    state.store.list_tasks(limit, offset).await
}

/// The stored record of a finished task.
pub async fn handle_get_record(state: &HandlerState, task_id: &str) -> Result<TaskRecord> {
    let id = parse_task_id(task_id)?;
    state
        .store
        .get_task(&id.to_string())
        .await?
        .ok_or_else(|| CoreError::TaskNotFound {
            task_id: id.to_string(),
        })
}

/// Event log rows for one call.
pub async fn handle_call_log(
    state: &HandlerState,
    correlation_id: &str,
) -> Result<Vec<TaskLogRecord>> {
    state.store.logs_for_correlation(correlation_id.trim()).await
}

/// RPC latency statistics and the depth of the work and dead-letter queues.
pub async fn handle_metrics(state: &HandlerState) -> MetricsReport {
    state.metrics.report().await
}
