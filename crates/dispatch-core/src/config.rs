// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Default work queue name.
pub const DEFAULT_WORK_QUEUE: &str = "data_queue";

/// Dispatch configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL for the task store
    pub database_url: String,
    /// Queue that call envelopes are published to
    pub work_queue: String,
    /// Default time an RPC caller waits for a reply
    pub rpc_timeout: Duration,
    /// How long idempotency records are replayed
    pub idempotency_ttl: Duration,
    /// Competing consumers started on the work queue
    pub consumer_count: usize,
    /// Maximum background tasks executing at once
    pub max_concurrent_tasks: usize,
    /// Service name stamped on event-log rows
    pub service_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DISPATCH_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DISPATCH_WORK_QUEUE`: work queue name (default: data_queue)
    /// - `DISPATCH_RPC_TIMEOUT_SECS`: default RPC timeout (default: 300)
    /// - `DISPATCH_IDEMPOTENCY_TTL_SECS`: idempotency retention (default: 3600)
    /// - `DISPATCH_CONSUMER_COUNT`: competing consumers (default: 2)
    /// - `DISPATCH_MAX_CONCURRENT_TASKS`: background task concurrency (default: 32)
    /// - `DISPATCH_SERVICE_NAME`: service name for event logs (default: data)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DISPATCH_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DISPATCH_DATABASE_URL"))?;

        let work_queue = std::env::var("DISPATCH_WORK_QUEUE")
            .unwrap_or_else(|_| DEFAULT_WORK_QUEUE.to_string());
        if work_queue.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "DISPATCH_WORK_QUEUE",
                "must not be empty",
            ));
        }

        let rpc_timeout_secs: u64 = std::env::var("DISPATCH_RPC_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DISPATCH_RPC_TIMEOUT_SECS", "must be a positive integer")
            })?;
        if rpc_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "DISPATCH_RPC_TIMEOUT_SECS",
                "must be a positive integer",
            ));
        }

        let idempotency_ttl_secs: u64 = std::env::var("DISPATCH_IDEMPOTENCY_TTL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DISPATCH_IDEMPOTENCY_TTL_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let consumer_count: usize = std::env::var("DISPATCH_CONSUMER_COUNT")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DISPATCH_CONSUMER_COUNT", "must be a non-negative integer")
            })?;

        let max_concurrent_tasks: usize = std::env::var("DISPATCH_MAX_CONCURRENT_TASKS")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DISPATCH_MAX_CONCURRENT_TASKS", "must be a positive integer")
            })?;
        if max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "DISPATCH_MAX_CONCURRENT_TASKS",
                "must be a positive integer",
            ));
        }

        let service_name =
            std::env::var("DISPATCH_SERVICE_NAME").unwrap_or_else(|_| "data".to_string());

        Ok(Self {
            database_url,
            work_queue,
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            consumer_count,
            max_concurrent_tasks,
            service_name,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
