// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-and-forget task tracking.
//!
//! A submitted task gets an identifier immediately and executes in the
//! background on an [`ExecutionBackend`]. Its status moves once, from
//! `pending` to `succeeded` or `failed`, and the terminal status is written to
//! the task store exactly once.

mod worker_pool;

pub use worker_pool::WorkerPoolBackend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::CoreError;
use crate::persistence::TaskRecord;
use crate::rpc::RpcError;

/// Identifier of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
}

impl From<&RpcError> for TaskFailure {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Remote { code, message } => Self {
                code: code.clone(),
                message: message.clone(),
            },
            other => Self {
                code: other.error_code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Status of a background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Succeeded { outcome: Value },
    Failed { error: TaskFailure },
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl TryFrom<&TaskRecord> for TaskStatus {
    type Error = CoreError;

    fn try_from(record: &TaskRecord) -> Result<Self, Self::Error> {
        match record.status.as_str() {
            "succeeded" => {
                let outcome = match &record.outcome {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => Value::Null,
                };
                Ok(Self::Succeeded { outcome })
            }
            "failed" => Ok(Self::Failed {
                error: TaskFailure {
                    code: record.error_code.clone().unwrap_or_default(),
                    message: record.error_message.clone().unwrap_or_default(),
                },
            }),
            other => Err(CoreError::InvalidTaskState {
                task_id: record.task_id.clone(),
                expected: "succeeded or failed".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

/// Work to execute in the background.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub task_kind: String,
    pub payload: Value,
}

/// A task and everything known about it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub task_id: TaskId,
    pub job: Job,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn pending(job: Job) -> Self {
        Self {
            task_id: TaskId::new(),
            job,
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to a terminal status. Only `pending -> succeeded | failed` is allowed.
    pub fn finish(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                task_id: self.task_id,
                from: self.status.name(),
                to: status.name(),
            });
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// The durable record of a terminal task.
    pub fn to_record(&self) -> Result<TaskRecord, CoreError> {
        let finished_at = self.finished_at.ok_or_else(|| CoreError::InvalidTaskState {
            task_id: self.task_id.to_string(),
            expected: "succeeded or failed".to_string(),
            actual: self.status.name().to_string(),
        })?;

        let (outcome, error_code, error_message) = match &self.status {
            TaskStatus::Succeeded { outcome } => {
                (Some(serde_json::to_string(outcome)?), None, None)
            }
            TaskStatus::Failed { error } => {
                (None, Some(error.code.clone()), Some(error.message.clone()))
            }
            TaskStatus::Pending => (None, None, None),
        };

        Ok(TaskRecord {
            task_id: self.task_id.to_string(),
            task_kind: self.job.task_kind.clone(),
            status: self.status.name().to_string(),
            payload: serde_json::to_string(&self.job.payload)?,
            outcome,
            error_code,
            error_message,
            submitted_at: self.submitted_at,
            finished_at,
        })
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("task executor is shut down")]
    Closed,

    #[error("task store error: {0}")]
    Store(#[from] CoreError),
}

/// Executes submitted jobs in the background and reports their status.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Accept a job. Returns as soon as the job is registered as pending.
    async fn submit(&self, job: Job) -> Result<TaskId, TaskError>;

    async fn status(&self, task_id: &TaskId) -> Result<TaskStatus, TaskError>;
}

/// Front door for background tasks.
#[derive(Clone)]
pub struct TaskTracker {
    backend: Arc<dyn ExecutionBackend>,
}

impl TaskTracker {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    /// Start processing `payload` with `task_kind` in the background.
    pub async fn submit(&self, payload: Value, task_kind: &str) -> Result<TaskId, TaskError> {
        self.backend
            .submit(Job {
                task_kind: task_kind.to_string(),
                payload,
            })
            .await
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<TaskStatus, TaskError> {
        self.backend.status(task_id).await
    }
}
