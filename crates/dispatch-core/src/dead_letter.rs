// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dead-letter topology for work queues.
//!
//! Every work queue `<name>` is paired with a holding queue `<name>_dlq`.
//! Messages a worker cannot process are rejected without requeue and land in
//! the holding queue exactly once.

use dispatch_broker::{
    Broker, BrokerError, HEADER_DEATH_QUEUE, HEADER_DEATH_REASON, Message, QueueOptions,
};
use tracing::{debug, info};

use crate::envelope::CorrelationToken;

/// Suffix of the holding queue paired with a work queue.
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// Naming and declaration of dead-letter queues.
#[derive(Debug, Clone)]
pub struct DeadLetterPolicy {
    suffix: String,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            suffix: DEAD_LETTER_SUFFIX.to_string(),
        }
    }
}

impl DeadLetterPolicy {
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn dead_letter_queue(&self, work_queue: &str) -> String {
        format!("{work_queue}{}", self.suffix)
    }

    /// Declare `work_queue` and its holding queue. Returns the holding queue name.
    pub async fn declare(
        &self,
        broker: &dyn Broker,
        work_queue: &str,
    ) -> Result<String, BrokerError> {
        let dlq = self.dead_letter_queue(work_queue);
        broker.declare_queue(&dlq, QueueOptions::durable()).await?;
        broker
            .declare_queue(
                work_queue,
                QueueOptions::durable().with_dead_letter_queue(dlq.clone()),
            )
            .await?;
        info!(queue = %work_queue, dead_letter_queue = %dlq, "Work queue declared");
        Ok(dlq)
    }
}

/// A message taken off a dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: Message,
    /// Correlation token of the original call, when it carried a valid one.
    pub correlation_token: Option<CorrelationToken>,
    /// Why the message was dead-lettered.
    pub reason: Option<String>,
    /// Queue the message was rejected from.
    pub source_queue: Option<String>,
}

impl From<Message> for DeadLetter {
    fn from(message: Message) -> Self {
        Self {
            correlation_token: message.correlation_id().and_then(|id| id.parse().ok()),
            reason: message.header(HEADER_DEATH_REASON).map(str::to_string),
            source_queue: message.header(HEADER_DEATH_QUEUE).map(str::to_string),
            message,
        }
    }
}

/// Remove up to `limit` messages from a dead-letter queue.
pub async fn drain_dead_letters(
    broker: &dyn Broker,
    dead_letter_queue: &str,
    limit: usize,
) -> Result<Vec<DeadLetter>, BrokerError> {
    let mut drained = Vec::new();
    while drained.len() < limit {
        let Some(delivery) = broker.get(dead_letter_queue).await? else {
            break;
        };
        let message = delivery.message.clone();
        delivery.ack().await?;
        drained.push(DeadLetter::from(message));
    }
    debug!(queue = %dead_letter_queue, count = drained.len(), "Dead letters drained");
    Ok(drained)
}
