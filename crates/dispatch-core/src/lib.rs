// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Core - Broker RPC and Background Task Engine
//!
//! This crate turns a message broker into a request/response transport. A
//! caller publishes a call envelope to a work queue and waits on a private,
//! auto-deleted reply channel; competing consumers apply a transform and
//! publish the outcome back. Around that core it offers fire-and-forget task
//! tracking with durable terminal records, idempotent request handling, and
//! RPC latency and queue depth metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   call envelope    ┌──────────────────────────┐
//! │      RpcClient       │───────────────────►│        work queue        │
//! │ (CorrelationRegistry)│                    │   (dead letters → _dlq)  │
//! └──────────────────────┘                    └────────────┬─────────────┘
//!           ▲                                              │ competing
//!           │ reply envelope                               ▼ consumers
//! ┌──────────────────────┐                    ┌──────────────────────────┐
//! │ reply_{token} queue  │◄───────────────────│       WorkConsumer       │
//! │ (exclusive, auto-del)│                    │   (TransformRegistry)    │
//! └──────────────────────┘                    └──────────────────────────┘
//! ```
//!
//! # Call Lifecycle
//!
//! | Event | Emitted by | Meaning |
//! |-------|------------|---------|
//! | `published` | caller | Call envelope routed to a consumer |
//! | `no_subscriber` | caller | Nobody consumes the work queue; failed fast |
//! | `reply_received` | caller | Matching reply delivered to the waiter |
//! | `reply_dropped` | caller | Reply with no live waiter, discarded |
//! | `timed_out` | caller | No reply within the timeout |
//! | `received` | worker | Call taken off the work queue |
//! | `replied` | worker | Reply published |
//! | `rejected` | worker | Call dead-lettered |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DISPATCH_DATABASE_URL` | Yes | - | SQLite or PostgreSQL connection string |
//! | `DISPATCH_WORK_QUEUE` | No | `data_queue` | Work queue name |
//! | `DISPATCH_RPC_TIMEOUT_SECS` | No | `300` | Default call timeout |
//! | `DISPATCH_IDEMPOTENCY_TTL_SECS` | No | `3600` | Idempotency record retention |
//! | `DISPATCH_CONSUMER_COUNT` | No | `2` | Competing consumers |
//! | `DISPATCH_MAX_CONCURRENT_TASKS` | No | `32` | Background task concurrency |
//! | `DISPATCH_SERVICE_NAME` | No | `data` | Service name on event-log rows |

/// Configuration loaded from environment variables.
pub mod config;

/// Work queue consumers.
pub mod consumer;

/// Dead-letter queue topology and inspection.
pub mod dead_letter;

/// Call and reply envelopes and their wire format.
pub mod envelope;

/// Error types with error code mapping.
pub mod error;

/// Call lifecycle events and sinks.
pub mod events;

/// Transport-agnostic request handlers.
pub mod handlers;

/// Idempotent request execution.
pub mod idempotency;

/// RPC latency, timeout and queue depth metrics.
pub mod metrics;

/// Embedded database migrations.
pub mod migrations;

/// Task store backends.
pub mod persistence;

/// Pending-call bookkeeping.
pub mod registry;

/// Broker RPC client.
pub mod rpc;

/// Embeddable runtime.
pub mod runtime;

/// Newline-delimited JSON request server.
pub mod server;

/// Background task tracking.
pub mod tasks;

/// Task transforms applied by workers.
pub mod transform;

pub use error::{CoreError, Result};
pub use rpc::{RpcClient, RpcError};
pub use runtime::DispatchRuntime;
