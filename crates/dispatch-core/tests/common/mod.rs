// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for dispatch-core integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dispatch_broker::MemoryBroker;
use dispatch_core::events::RecordingSink;
use dispatch_core::handlers::HandlerState;
use dispatch_core::persistence::{SqliteTaskStore, TaskStore};
use dispatch_core::runtime::{DispatchRuntime, DispatchRuntimeBuilder};

pub const WORK_QUEUE: &str = "data_queue";

/// A started runtime on an in-memory broker and an in-memory SQLite store.
pub struct TestContext {
    pub broker: MemoryBroker,
    pub store: Arc<SqliteTaskStore>,
    pub sink: Arc<RecordingSink>,
    pub runtime: DispatchRuntime,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with(|builder| builder).await
    }

    /// Start a runtime after applying `configure` to the default builder.
    pub async fn with(
        configure: impl FnOnce(DispatchRuntimeBuilder) -> DispatchRuntimeBuilder,
    ) -> Self {
        let broker = MemoryBroker::new();
        let store = Arc::new(
            SqliteTaskStore::connect("sqlite::memory:")
                .await
                .expect("Failed to open SQLite store"),
        );
        let sink = Arc::new(RecordingSink::new());

        let builder = DispatchRuntime::builder()
            .broker(Arc::new(broker.clone()))
            .store(store.clone())
            .event_sink(sink.clone())
            .work_queue(WORK_QUEUE)
            .consumer_count(2)
            .rpc_timeout(Duration::from_secs(5));

        let runtime = configure(builder)
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        Self {
            broker,
            store,
            sink,
            runtime,
        }
    }

    pub fn state(&self) -> &HandlerState {
        self.runtime.state()
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    /// Names of reply channels that still exist.
    pub fn reply_queues(&self) -> Vec<String> {
        self.broker
            .queue_names()
            .into_iter()
            .filter(|name| name.starts_with("reply_"))
            .collect()
    }
}

/// Poll `check` every 10ms until it returns `Some`, for at most five seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
