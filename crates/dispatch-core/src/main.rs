// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Core - standalone server
//!
//! Runs the work consumers and the background task executor on an in-process
//! broker and serves newline-delimited JSON requests from stdin.

use std::sync::Arc;

use anyhow::Result;
use dispatch_broker::MemoryBroker;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{error, info};

use dispatch_core::config::Config;
use dispatch_core::persistence;
use dispatch_core::runtime::{DispatchRuntime, RuntimeOptions};
use dispatch_core::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries responses.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dispatch_core=info".parse()?),
        )
        .init();

    info!("Starting Dispatch Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        work_queue = %config.work_queue,
        rpc_timeout_secs = config.rpc_timeout.as_secs(),
        consumers = config.consumer_count,
        "Configuration loaded"
    );

    info!("Connecting to task store...");
    let store = persistence::connect(&config.database_url).await?;
    if !store.health_check().await? {
        anyhow::bail!("task store health check failed");
    }
    info!("Task store ready");

    let runtime = DispatchRuntime::builder()
        .broker(Arc::new(MemoryBroker::new()))
        .store(store)
        .options(RuntimeOptions::from(&config))
        .build()?
        .start()
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = runtime.state().clone();
    let mut server_handle = tokio::spawn(server::serve(
        state,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_rx,
    ));

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Input closed"),
                Ok(Err(e)) => error!("Request server error: {}", e),
                Err(e) => error!("Request server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
            if let Err(e) = server_handle.await {
                error!("Request server task panicked: {}", e);
            }
        }
    }

    runtime.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}
