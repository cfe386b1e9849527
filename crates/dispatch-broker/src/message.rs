// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages and queue declarations.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Header set on dead-lettered messages: why the message left its queue.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

/// Header set on dead-lettered messages: the queue the message was rejected from.
pub const HEADER_DEATH_QUEUE: &str = "x-death-queue";

/// AMQP-style message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlates a reply with its request.
    pub correlation_id: Option<String>,
    /// Queue the consumer should publish its reply to.
    pub reply_to: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Free-form string headers.
    pub headers: BTreeMap<String, String>,
}

/// A message as published to, and delivered from, a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque body bytes.
    pub body: Bytes,
    /// Message properties.
    pub properties: MessageProperties,
}

impl Message {
    /// Create a message with empty properties.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to queue.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    /// Correlation id, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    /// Reply-to queue, if set.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Look up a header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.properties.headers.get(key).map(String::as_str)
    }
}

/// Options used when declaring a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring client; other declarations are refused.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Where messages rejected without requeue are routed.
    ///
    /// Equivalent to an `x-dead-letter-exchange` / `x-dead-letter-routing-key`
    /// pair pointing at a single holding queue.
    pub dead_letter_queue: Option<String>,
}

impl QueueOptions {
    /// A durable, shared queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// An exclusive, auto-deleting queue for a single caller's replies.
    pub fn reply_channel() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_queue: None,
        }
    }

    /// Route rejected messages to `queue`.
    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }
}

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The message was enqueued.
    Queued,
    /// No queue matched; the message was discarded.
    Dropped,
}
