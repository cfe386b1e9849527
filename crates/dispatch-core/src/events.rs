// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle events emitted by the RPC client and the work consumer.
//!
//! Events are handed to an [`EventSink`]. Sinks must not block: they are called
//! inline on the request path. [`EventLogSink`] queues rows for a background
//! [`EventLogWriter`] which appends them to the task store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::CorrelationToken;
use crate::persistence::{TaskLogRecord, TaskStore};

/// Something that happened to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A call was published to its work queue.
    CallPublished {
        token: CorrelationToken,
        queue: String,
        task_kind: String,
    },
    /// Publishing failed because nobody consumes the work queue.
    NoSubscriber {
        token: CorrelationToken,
        queue: String,
        task_kind: String,
    },
    /// The reply for a pending call arrived.
    ReplyReceived {
        token: CorrelationToken,
        task_kind: String,
        success: bool,
        elapsed: Duration,
    },
    /// A reply arrived for a call nobody waits for any more.
    ReplyDropped { token: CorrelationToken },
    /// The caller gave up waiting.
    CallTimedOut {
        token: CorrelationToken,
        queue: String,
        task_kind: String,
        elapsed: Duration,
    },
    /// A worker picked a message off a work queue.
    CallReceived {
        token: Option<CorrelationToken>,
        queue: String,
    },
    /// A worker published the reply to a call.
    CallReplied {
        token: CorrelationToken,
        queue: String,
        task_kind: String,
        success: bool,
    },
    /// A worker rejected a message without requeue.
    CallRejected {
        token: Option<CorrelationToken>,
        queue: String,
        reason: String,
    },
}

impl LifecycleEvent {
    /// Short stable name, used as the log row status.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallPublished { .. } => "published",
            Self::NoSubscriber { .. } => "no_subscriber",
            Self::ReplyReceived { .. } => "reply_received",
            Self::ReplyDropped { .. } => "reply_dropped",
            Self::CallTimedOut { .. } => "timed_out",
            Self::CallReceived { .. } => "received",
            Self::CallReplied { .. } => "replied",
            Self::CallRejected { .. } => "rejected",
        }
    }

    pub fn correlation_token(&self) -> Option<CorrelationToken> {
        match self {
            Self::CallPublished { token, .. }
            | Self::NoSubscriber { token, .. }
            | Self::ReplyReceived { token, .. }
            | Self::ReplyDropped { token }
            | Self::CallTimedOut { token, .. }
            | Self::CallReplied { token, .. } => Some(*token),
            Self::CallReceived { token, .. } | Self::CallRejected { token, .. } => *token,
        }
    }

    fn queue(&self) -> Option<&str> {
        match self {
            Self::CallPublished { queue, .. }
            | Self::NoSubscriber { queue, .. }
            | Self::CallTimedOut { queue, .. }
            | Self::CallReceived { queue, .. }
            | Self::CallReplied { queue, .. }
            | Self::CallRejected { queue, .. } => Some(queue),
            Self::ReplyReceived { .. } | Self::ReplyDropped { .. } => None,
        }
    }

    fn task_kind(&self) -> Option<&str> {
        match self {
            Self::CallPublished { task_kind, .. }
            | Self::NoSubscriber { task_kind, .. }
            | Self::ReplyReceived { task_kind, .. }
            | Self::CallTimedOut { task_kind, .. }
            | Self::CallReplied { task_kind, .. } => Some(task_kind),
            _ => None,
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            Self::ReplyReceived {
                success, elapsed, ..
            } => Some(format!(
                "{} after {}ms",
                if *success { "success" } else { "remote error" },
                elapsed.as_millis()
            )),
            Self::CallTimedOut { elapsed, .. } => {
                Some(format!("timed out after {}ms", elapsed.as_millis()))
            }
            Self::CallReplied { success: false, .. } => Some("remote error".to_string()),
            Self::CallRejected { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &LifecycleEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &LifecycleEvent) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::CallPublished {
                token,
                queue,
                task_kind,
            } => info!(%token, queue = %queue, task_kind = %task_kind, "Call published"),
            LifecycleEvent::NoSubscriber {
                token,
                queue,
                task_kind,
            } => warn!(%token, queue = %queue, task_kind = %task_kind, "No consumer on work queue"),
            LifecycleEvent::ReplyReceived {
                token,
                task_kind,
                success,
                elapsed,
            } => info!(
                %token,
                task_kind = %task_kind,
                success,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reply received"
            ),
            LifecycleEvent::ReplyDropped { token } => {
                debug!(%token, "Reply for unknown call dropped")
            }
            LifecycleEvent::CallTimedOut {
                token,
                queue,
                task_kind,
                elapsed,
            } => warn!(
                %token,
                queue = %queue,
                task_kind = %task_kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "Call timed out"
            ),
            LifecycleEvent::CallReceived { token, queue } => {
                debug!(token = ?token, queue = %queue, "Call received")
            }
            LifecycleEvent::CallReplied {
                token,
                queue,
                task_kind,
                success,
            } => info!(%token, queue = %queue, task_kind = %task_kind, success, "Call replied"),
            LifecycleEvent::CallRejected {
                token,
                queue,
                reason,
            } => warn!(token = ?token, queue = %queue, reason = %reason, "Call rejected"),
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of the recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(LifecycleEvent::name).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Queues events as task log rows for an [`EventLogWriter`].
#[derive(Clone)]
pub struct EventLogSink {
    service_name: String,
    tx: mpsc::UnboundedSender<TaskLogRecord>,
}

impl EventLogSink {
    /// Create the sink and the writer that drains it.
    pub fn channel(
        service_name: impl Into<String>,
        store: Arc<dyn TaskStore>,
    ) -> (Self, EventLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                service_name: service_name.into(),
                tx,
            },
            EventLogWriter { store, rx },
        )
    }
}

impl EventSink for EventLogSink {
    fn record(&self, event: &LifecycleEvent) {
        let row = TaskLogRecord {
            correlation_id: event
                .correlation_token()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            queue_name: event.queue().map(str::to_string),
            service_name: self.service_name.clone(),
            task_kind: event.task_kind().unwrap_or("-").to_string(),
            status: event.name().to_string(),
            description: event.description(),
            created_at: Utc::now(),
        };
        if self.tx.send(row).is_err() {
            debug!(event = event.name(), "Event log writer stopped, row discarded");
        }
    }
}

/// Appends queued task log rows to the store.
pub struct EventLogWriter {
    store: Arc<dyn TaskStore>,
    rx: mpsc::UnboundedReceiver<TaskLogRecord>,
}

impl EventLogWriter {
    /// Run until shutdown is signalled or every sink is dropped.
    ///
    /// Rows already queued when shutdown is signalled are still written.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                row = self.rx.recv() => match row {
                    Some(row) => self.append(row).await,
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        while let Ok(row) = self.rx.try_recv() {
                            self.append(row).await;
                        }
                        break;
                    }
                }
            }
        }
        debug!("Event log writer stopped");
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    async fn append(&self, row: TaskLogRecord) {
        if let Err(e) = self.store.append_log(&row).await {
            warn!(
                correlation_id = %row.correlation_id,
                status = %row.status,
                error = %e,
                "Failed to append task log row"
            );
        }
    }
}
