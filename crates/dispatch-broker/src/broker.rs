// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The transport contract.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::message::{Message, QueueOptions, Routed};

/// Errors reported by a [`Broker`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no consumers on queue '{0}'")]
    NoConsumers(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue '{0}' is exclusively owned by another client")]
    ResourceLocked(String),

    #[error("queue '{0}' already declared with different options")]
    PreconditionFailed(String),

    #[error("delivery {tag} on queue '{queue}' is unknown or already settled")]
    UnknownDelivery { queue: String, tag: u64 },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// A message broker providing named queues with at-least-once delivery.
///
/// Implementations must honour these semantics:
/// - `publish` with `require_consumer` fails with [`BrokerError::NoConsumers`]
///   when the target queue is missing or has no active subscription.
/// - `publish` to a missing queue without `require_consumer` drops the message
///   and reports [`Routed::Dropped`].
/// - Deliveries dropped without being settled are requeued as redelivered.
/// - Rejecting without requeue routes the message to the queue's dead-letter
///   queue, if one was declared, and discards it otherwise.
/// - An `auto_delete` queue disappears when its last subscription is dropped.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Redeclaring with identical options is a no-op.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Delete a queue and everything in it. Returns the number of purged
    /// messages; deleting a missing queue returns `Ok(0)`.
    async fn delete_queue(&self, name: &str) -> Result<usize, BrokerError>;

    /// Publish a message to a queue.
    async fn publish(
        &self,
        queue: &str,
        message: Message,
        require_consumer: bool,
    ) -> Result<Routed, BrokerError>;

    /// Subscribe to a queue as one of possibly many competing consumers.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Pull a single message without subscribing.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Number of messages ready for delivery.
    async fn message_count(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Number of active subscriptions.
    async fn consumer_count(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Whether the queue currently exists.
    async fn queue_exists(&self, queue: &str) -> bool;
}

/// A live subscription to a queue.
///
/// Dropping the subscription cancels it.
#[async_trait]
pub trait Subscription: Send {
    /// The subscribed queue.
    fn queue(&self) -> &str;

    /// Wait for the next delivery. `None` once the queue has been deleted.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

/// Settles deliveries on behalf of a broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Remove the delivery from the queue for good.
    async fn ack(&self, queue: &str, tag: u64) -> Result<(), BrokerError>;

    /// Return the delivery to the queue or dead-letter it.
    async fn reject(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Requeue an unsettled delivery that is being dropped.
    fn release(&self, queue: &str, tag: u64);
}

/// A message handed to a consumer, awaiting acknowledgement.
pub struct Delivery {
    /// Broker-assigned delivery tag, unique per broker.
    pub tag: u64,
    /// Queue the message was delivered from.
    pub queue: String,
    /// The message itself.
    pub message: Message,
    /// True if this message was delivered before and not acknowledged.
    pub redelivered: bool,
    acker: Arc<dyn Acker>,
    settled: bool,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Delivery {
    /// Create a delivery. Called by broker implementations.
    pub fn new(
        tag: u64,
        queue: impl Into<String>,
        message: Message,
        redelivered: bool,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            tag,
            queue: queue.into(),
            message,
            redelivered,
            acker,
            settled: false,
        }
    }

    /// Acknowledge the delivery as consumed.
    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.settled = true;
        self.acker.ack(&self.queue, self.tag).await
    }

    /// Reject the delivery, optionally returning it to the queue.
    pub async fn reject(mut self, requeue: bool) -> Result<(), BrokerError> {
        self.settled = true;
        self.acker.reject(&self.queue, self.tag, requeue).await
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            debug!(queue = %self.queue, tag = self.tag, "unsettled delivery dropped, requeueing");
            self.acker.release(&self.queue, self.tag);
        }
    }
}
