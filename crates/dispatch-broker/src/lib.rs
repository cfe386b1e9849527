// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Broker - message transport contract
//!
//! This crate defines what dispatch needs from a message broker and ships an
//! in-process implementation of it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      dispatch-broker                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Broker trait: declare / delete / publish / consume / get   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Delivery: ack, reject(requeue), requeue-on-drop            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MemoryBroker: competing consumers, exclusive auto-delete   │
//! │  reply queues, dead-letter routing                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_broker::{Broker, MemoryBroker, Message, QueueOptions};
//!
//! let broker = MemoryBroker::new();
//! broker.declare_queue("data_queue", QueueOptions::durable()).await?;
//!
//! let mut subscription = broker.consume("data_queue").await?;
//! broker.publish("data_queue", Message::new("hello"), true).await?;
//!
//! let delivery = subscription.next_delivery().await.unwrap();
//! delivery.ack().await?;
//! ```

pub mod broker;
pub mod memory;
pub mod message;

pub use broker::{Acker, Broker, BrokerError, Delivery, Subscription};
pub use memory::MemoryBroker;
pub use message::{
    HEADER_DEATH_QUEUE, HEADER_DEATH_REASON, Message, MessageProperties, QueueOptions, Routed,
};
