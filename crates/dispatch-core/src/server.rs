// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Newline-delimited JSON request server.
//!
//! Each input line is one request object tagged by `op`; each output line is
//! the matching response. Requests run concurrently, so responses can come
//! back out of order; a request's optional `id` is echoed on its response.
//!
//! ```text
//! {"id":1,"op":"process","payload":"hello world","task_kind":"uppercase"}
//! {"id":1,"result":{"task_id":"-","task_status":"Success","outcome":"HELLO WORLD"}}
//! ```

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker as JoinTracker;
use tracing::{debug, error, info, instrument};

use crate::error::CoreError;
use crate::handlers::{
    HandlerState, ProcessRequest, handle_call_log, handle_get_record, handle_list_records,
    handle_metrics, handle_process, handle_process_async, handle_task_status,
};
use crate::transform::DEFAULT_TASK_KIND;

fn default_task_kind() -> String {
    DEFAULT_TASK_KIND.to_string()
}

fn default_limit() -> i64 {
    50
}

/// A request, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Process {
        payload: Value,
        #[serde(default = "default_task_kind")]
        task_kind: String,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    ProcessAsync {
        payload: Value,
        #[serde(default = "default_task_kind")]
        task_kind: String,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Status {
        task_id: String,
    },
    Records {
        #[serde(default = "default_limit")]
        limit: i64,
        #[serde(default)]
        offset: i64,
    },
    GetRecord {
        task_id: String,
    },
    CallLog {
        correlation_id: String,
    },
    Health,
    Metrics {
        #[serde(default)]
        format: MetricsFormat,
    },
}

/// Output of the `metrics` operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsFormat {
    /// Structured report of RPC latency and queue depths.
    #[default]
    Json,
    /// Prometheus text exposition, returned as a string.
    Prometheus,
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Self::Process { .. } => "process",
            Self::ProcessAsync { .. } => "process_async",
            Self::Status { .. } => "status",
            Self::Records { .. } => "records",
            Self::GetRecord { .. } => "get_record",
            Self::CallLog { .. } => "call_log",
            Self::Health => "health",
            Self::Metrics { .. } => "metrics",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RequestLine {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        match err {
            // Surface the worker's own code.
            CoreError::RemoteError { code, message } => Self {
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

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseLine {
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseLine {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<Value>, error: ErrorBody) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Route a request to its handler.
///
/// A replayed idempotent response decodes to the same value as the first one.
pub async fn handle_request(state: &HandlerState, request: Request) -> Result<Value, CoreError> {
    match request {
        Request::Process {
            payload,
            task_kind,
            idempotency_key,
        } => {
            let response = handle_process(
                state,
                idempotency_key.as_deref(),
                ProcessRequest { payload, task_kind },
            )
            .await?;
            Ok(serde_json::from_slice(&response.body)?)
        }
        Request::ProcessAsync {
            payload,
            task_kind,
            idempotency_key,
        } => {
            let response = handle_process_async(
                state,
                idempotency_key.as_deref(),
                ProcessRequest { payload, task_kind },
            )
            .await?;
            Ok(serde_json::from_slice(&response.body)?)
        }
        Request::Status { task_id } => {
            let response = handle_task_status(state, &task_id).await?;
            Ok(serde_json::to_value(response)?)
        }
        Request::Records { limit, offset } => {
            let records = handle_list_records(state, limit, offset).await?;
            Ok(serde_json::to_value(records)?)
        }
        Request::GetRecord { task_id } => {
            let record = handle_get_record(state, &task_id).await?;
            Ok(serde_json::to_value(record)?)
        }
        Request::CallLog { correlation_id } => {
            let rows = handle_call_log(state, &correlation_id).await?;
            Ok(serde_json::to_value(rows)?)
        }
        Request::Health => {
            let healthy = state.store().health_check().await?;
            Ok(json!({
                "healthy": healthy,
                "pending_calls": state.rpc().registry().len(),
            }))
        }
        Request::Metrics {
            format: MetricsFormat::Json,
        } => Ok(serde_json::to_value(handle_metrics(state).await)?),
        Request::Metrics {
            format: MetricsFormat::Prometheus,
        } => {
            let text = state
                .metrics()
                .render()
                .await
                .map_err(|e| CoreError::Unavailable {
                    reason: format!("metrics encoding failed: {e}"),
                })?;
            Ok(Value::String(text))
        }
    }
}

/// Decode and handle one input line.
pub async fn handle_line(state: &HandlerState, line: &str) -> ResponseLine {
    let parsed: RequestLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").cloned());
            return ResponseLine::err(
                id,
                ErrorBody {
                    code: "VALIDATION_ERROR".to_string(),
                    message: format!("invalid request: {}", e),
                },
            );
        }
    };

    let op = parsed.request.op();
    debug!(op, "Received request");
    match handle_request(state, parsed.request).await {
        Ok(result) => ResponseLine::ok(parsed.id, result),
        Err(e) => {
            debug!(op, error = %e, "Request failed");
            ResponseLine::err(parsed.id, ErrorBody::from(&e))
        }
    }
}

/// Serve requests from `reader` until it is exhausted or shutdown is
/// signalled. Requests already running are answered before this returns.
#[instrument(skip_all)]
pub async fn serve<R, W>(
    state: Arc<HandlerState>,
    reader: R,
    mut writer: W,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseLine>();

    let write_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let requests = JoinTracker::new();
    let mut lines = reader.lines();
    info!("Request server started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Request server received shutdown signal");
                    break;
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Request input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let state = state.clone();
                let tx = tx.clone();
                requests.spawn(async move {
                    let response = handle_line(&state, &line).await;
                    let _ = tx.send(response);
                });
            }
        }
    }

    requests.close();
    requests.wait().await;
    drop(tx);

    if let Err(e) = write_task.await? {
        error!("Failed to write responses: {}", e);
        return Err(e);
    }
    info!("Request server stopped");
    Ok(())
}
