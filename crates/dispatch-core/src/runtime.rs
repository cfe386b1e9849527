// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for dispatch-core.
//!
//! [`DispatchRuntime`] wires a broker and a task store into a running set of
//! work consumers, an RPC client, the background task executor and the
//! idempotency guard, so an application can serve requests through
//! [`HandlerState`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dispatch_broker::MemoryBroker;
//! use dispatch_core::runtime::DispatchRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = dispatch_core::persistence::connect("sqlite::memory:").await?;
//!
//!     let runtime = DispatchRuntime::builder()
//!         .broker(Arc::new(MemoryBroker::new()))
//!         .store(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests through runtime.state() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dispatch_broker::Broker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_WORK_QUEUE};
use crate::consumer::{WorkConsumer, start_consumers};
use crate::dead_letter::DeadLetterPolicy;
use crate::events::{EventLogSink, EventSink, FanoutSink, TracingSink};
use crate::handlers::HandlerState;
use crate::idempotency::{DEFAULT_IDEMPOTENCY_TTL, DuplicatePolicy, IdempotencyGuard};
use crate::metrics::{MetricsReporter, MetricsSink};
use crate::persistence::TaskStore;
use crate::rpc::{DEFAULT_RPC_TIMEOUT, RpcClient};
use crate::tasks::{TaskTracker, WorkerPoolBackend};
use crate::transform::TransformRegistry;

/// How often expired idempotency records are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for a [`DispatchRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub work_queue: String,
    pub rpc_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub duplicate_policy: DuplicatePolicy,
    pub consumer_count: usize,
    pub max_concurrent_tasks: usize,
    pub service_name: String,
    /// How long shutdown waits for background tasks.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            duplicate_policy: DuplicatePolicy::default(),
            consumer_count: 2,
            max_concurrent_tasks: 32,
            service_name: "data".to_string(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for RuntimeOptions {
    fn from(config: &Config) -> Self {
        Self {
            work_queue: config.work_queue.clone(),
            rpc_timeout: config.rpc_timeout,
            idempotency_ttl: config.idempotency_ttl,
            consumer_count: config.consumer_count,
            max_concurrent_tasks: config.max_concurrent_tasks,
            service_name: config.service_name.clone(),
            ..Self::default()
        }
    }
}

/// Builder for creating a [`DispatchRuntime`].
#[derive(Default)]
pub struct DispatchRuntimeBuilder {
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn TaskStore>>,
    transforms: Option<Arc<TransformRegistry>>,
    event_sink: Option<Arc<dyn EventSink>>,
    options: RuntimeOptions,
}

impl std::fmt::Debug for DispatchRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntimeBuilder")
            .field("broker", &self.broker.as_ref().map(|_| "..."))
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("options", &self.options)
            .finish()
    }
}

impl DispatchRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message broker (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the task store (required).
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Transforms the work consumers apply.
    ///
    /// Default: [`TransformRegistry::with_builtins`]
    pub fn transforms(mut self, transforms: Arc<TransformRegistry>) -> Self {
        self.transforms = Some(transforms);
        self
    }

    /// An extra sink for lifecycle events, alongside tracing and the event log.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn work_queue(mut self, queue: impl Into<String>) -> Self {
        self.options.work_queue = queue.into();
        self
    }

    pub fn consumer_count(mut self, count: usize) -> Self {
        self.options.consumer_count = count;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.options.rpc_timeout = timeout;
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.options.duplicate_policy = policy;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<DispatchRuntimeConfig> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.options.work_queue.trim().is_empty() {
            anyhow::bail!("work queue name must not be empty");
        }

        Ok(DispatchRuntimeConfig {
            broker,
            store,
            transforms: self
                .transforms
                .unwrap_or_else(|| Arc::new(TransformRegistry::with_builtins())),
            event_sink: self.event_sink,
            options: self.options,
        })
    }
}

/// Configuration for a [`DispatchRuntime`].
pub struct DispatchRuntimeConfig {
    broker: Arc<dyn Broker>,
    store: Arc<dyn TaskStore>,
    transforms: Arc<TransformRegistry>,
    event_sink: Option<Arc<dyn EventSink>>,
    options: RuntimeOptions,
}

impl std::fmt::Debug for DispatchRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntimeConfig")
            .field("broker", &"...")
            .field("store", &"...")
            .field("options", &self.options)
            .finish()
    }
}

impl DispatchRuntimeConfig {
    /// Declare the queue topology and start consumers and background workers.
    pub async fn start(self) -> Result<DispatchRuntime> {
        let options = self.options;
        let dlq = DeadLetterPolicy::default()
            .declare(self.broker.as_ref(), &options.work_queue)
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (log_sink, writer) = EventLogSink::channel(&options.service_name, self.store.clone());
        let writer_handle = writer.spawn(shutdown_rx.clone());

        let metrics_sink = Arc::new(MetricsSink::new()?);
        let metrics = MetricsReporter::new(
            metrics_sink.clone(),
            self.broker.clone(),
            vec![options.work_queue.clone(), dlq.clone()],
        );

        let sinks: Vec<Arc<dyn EventSink>> =
            vec![Arc::new(TracingSink), Arc::new(log_sink), metrics_sink];
        let mut fanout = FanoutSink::new(sinks);
        if let Some(sink) = self.event_sink {
            fanout.push(sink);
        }
        let sink: Arc<dyn EventSink> = Arc::new(fanout);

        let consumer = WorkConsumer::new(
            self.broker.clone(),
            &options.work_queue,
            self.transforms,
        )
        .with_event_sink(sink.clone());
        let consumer_handles =
            start_consumers(&consumer, options.consumer_count, &shutdown_rx).await?;

        let rpc = Arc::new(
            RpcClient::new(self.broker.clone())
                .with_event_sink(sink)
                .with_default_timeout(options.rpc_timeout),
        );
        let backend = Arc::new(WorkerPoolBackend::new(
            rpc.clone(),
            self.store.clone(),
            &options.work_queue,
            options.rpc_timeout,
            options.max_concurrent_tasks,
        ));
        let guard = Arc::new(
            IdempotencyGuard::new(options.idempotency_ttl).with_policy(options.duplicate_policy),
        );
        let purge_handle = tokio::spawn(purge_loop(guard.clone(), shutdown_rx));

        let state = Arc::new(HandlerState::new(
            rpc,
            TaskTracker::new(backend.clone()),
            guard,
            self.store,
            metrics,
            &options.work_queue,
            options.rpc_timeout,
        ));

        info!(
            work_queue = %options.work_queue,
            dead_letter_queue = %dlq,
            consumers = options.consumer_count,
            "DispatchRuntime started"
        );

        Ok(DispatchRuntime {
            broker: self.broker,
            state,
            backend,
            shutdown_tx,
            consumer_handles,
            writer_handle,
            purge_handle,
            shutdown_grace: options.shutdown_grace,
        })
    }
}

/// A running dispatch instance.
///
/// The runtime manages:
/// - Competing consumers on the work queue
/// - The background task executor
/// - The event-log writer
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DispatchRuntime {
    broker: Arc<dyn Broker>,
    state: Arc<HandlerState>,
    backend: Arc<WorkerPoolBackend>,
    shutdown_tx: watch::Sender<bool>,
    consumer_handles: Vec<JoinHandle<()>>,
    writer_handle: JoinHandle<()>,
    purge_handle: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl DispatchRuntime {
    pub fn builder() -> DispatchRuntimeBuilder {
        DispatchRuntimeBuilder::new()
    }

    /// Shared handler state for serving requests.
    pub fn state(&self) -> &Arc<HandlerState> {
        &self.state
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.state.store()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Background tasks get the grace period to finish while consumers keep
    /// serving them. Then consumers stop and queued event-log rows are
    /// written.
    pub async fn shutdown(self) -> Result<()> {
        info!("DispatchRuntime shutting down...");

        if !self.backend.shutdown(self.shutdown_grace).await {
            warn!(
                remaining = self.backend.in_flight(),
                "Abandoning unfinished background tasks"
            );
        }

        let _ = self.shutdown_tx.send(true);

        let mut failed = 0usize;
        for handle in self.consumer_handles {
            if let Err(e) = handle.await {
                error!("Work consumer task panicked: {}", e);
                failed += 1;
            }
        }
        if let Err(e) = self.writer_handle.await {
            error!("Event log writer task panicked: {}", e);
            failed += 1;
        }
        if let Err(e) = self.purge_handle.await {
            error!("Idempotency purge task panicked: {}", e);
            failed += 1;
        }

        if failed > 0 {
            return Err(anyhow::anyhow!("{} runtime task(s) panicked", failed));
        }
        info!("DispatchRuntime shutdown complete");
        Ok(())
    }

    /// Check whether the consumers are still running.
    pub fn is_running(&self) -> bool {
        self.consumer_handles.iter().any(|h| !h.is_finished())
    }
}

async fn purge_loop(guard: Arc<IdempotencyGuard>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = guard.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired idempotency records");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
