// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response over a message broker.
//!
//! A call runs through these steps:
//!
//! 1. Declare a private reply channel `reply_<token>` and subscribe to it.
//! 2. Register the token in the [`CorrelationRegistry`].
//! 3. Publish the call envelope, requiring a consumer on the work queue.
//! 4. Route deliveries on the reply channel through the registry until the
//!    caller's own reply resolves or the deadline passes.
//! 5. Delete the reply channel and unregister, on every exit path.
//!
//! Replies that arrive after the caller gave up find no registry entry and are
//! dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatch_broker::{Broker, BrokerError, Delivery, QueueOptions, Subscription};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::envelope::{CallEnvelope, CorrelationToken, EnvelopeError, Outcome, ReplyEnvelope};
use crate::events::{EventSink, LifecycleEvent, NoopSink};
use crate::registry::{CorrelationRegistry, PendingReply, RegistryError};

/// Default time a caller waits for a reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no consumer subscribed to queue '{queue}'")]
    NoSubscriber { queue: String },

    #[error("no reply from queue '{queue}' within {timeout:?}")]
    TimedOut { queue: String, timeout: Duration },

    #[error("remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("call {0} was abandoned before a reply arrived")]
    Abandoned(CorrelationToken),

    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RpcError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSubscriber { .. } => "NO_SUBSCRIBER",
            Self::TimedOut { .. } => "TIMEOUT",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Abandoned(_) => "ABANDONED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Envelope(_) => "ENVELOPE_ERROR",
            Self::Registry(_) => "CORRELATION_ERROR",
        }
    }
}

/// Broker-based RPC client.
///
/// Cheap to share behind an `Arc`; concurrent calls never observe each other's
/// replies.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    registry: Arc<CorrelationRegistry>,
    sink: Arc<dyn EventSink>,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: Arc::new(CorrelationRegistry::new()),
            sink: Arc::new(NoopSink),
            default_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Share a registry with other clients.
    pub fn with_registry(mut self, registry: Arc<CorrelationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Call with the client's default timeout.
    pub async fn call_default(
        &self,
        work_queue: &str,
        task_kind: &str,
        payload: Value,
    ) -> Result<Value, RpcError> {
        self.call(work_queue, task_kind, payload, self.default_timeout)
            .await
    }

    /// Publish a call to `work_queue` and wait up to `timeout` for its reply.
    #[instrument(skip_all, fields(queue = %work_queue, task_kind = %task_kind))]
    pub async fn call(
        &self,
        work_queue: &str,
        task_kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let envelope = CallEnvelope::new(work_queue, task_kind, payload);

        self.broker
            .declare_queue(&envelope.reply_channel, QueueOptions::reply_channel())
            .await?;

        let result = self.exchange(&envelope, timeout).await;

        match self.broker.delete_queue(&envelope.reply_channel).await {
            Ok(purged) if purged > 0 => {
                debug!(
                    reply_channel = %envelope.reply_channel,
                    purged,
                    "Reply channel deleted with unread replies"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    reply_channel = %envelope.reply_channel,
                    error = %e,
                    "Failed to delete reply channel"
                );
            }
        }

        result
    }

    async fn exchange(
        &self,
        envelope: &CallEnvelope,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let mut subscription = self.broker.consume(&envelope.reply_channel).await?;
        let mut pending = self
            .registry
            .register(envelope.correlation_token, envelope.reply_channel.clone())?;

        let message = envelope.to_message()?;
        let started = Instant::now();

        match self
            .broker
            .publish(&envelope.work_queue, message, true)
            .await
        {
            Ok(_) => self.sink.record(&LifecycleEvent::CallPublished {
                token: envelope.correlation_token,
                queue: envelope.work_queue.clone(),
                task_kind: envelope.task_kind.clone(),
            }),
            Err(BrokerError::NoConsumers(queue)) => {
                self.sink.record(&LifecycleEvent::NoSubscriber {
                    token: envelope.correlation_token,
                    queue: queue.clone(),
                    task_kind: envelope.task_kind.clone(),
                });
                return Err(RpcError::NoSubscriber { queue });
            }
            Err(e) => return Err(e.into()),
        }

        let reply = self
            .await_reply(envelope, subscription.as_mut(), &mut pending, timeout, started)
            .await?;

        match reply.outcome {
            Outcome::Success { result } => Ok(result),
            Outcome::Error { error } => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            }),
        }
    }

    async fn await_reply(
        &self,
        envelope: &CallEnvelope,
        subscription: &mut dyn Subscription,
        pending: &mut PendingReply<'_>,
        timeout: Duration,
        started: Instant,
    ) -> Result<ReplyEnvelope, RpcError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                reply = &mut pending.receiver => {
                    return reply.map_err(|_| RpcError::Abandoned(envelope.correlation_token));
                }

                delivery = subscription.next_delivery() => match delivery {
                    Some(delivery) => self.route_reply(delivery, started).await,
                    None => {
                        return Err(RpcError::Transport(BrokerError::QueueNotFound(
                            envelope.reply_channel.clone(),
                        )));
                    }
                },

                _ = &mut deadline => {
                    self.registry.remove(&envelope.correlation_token);
                    self.sink.record(&LifecycleEvent::CallTimedOut {
                        token: envelope.correlation_token,
                        queue: envelope.work_queue.clone(),
                        task_kind: envelope.task_kind.clone(),
                        elapsed: started.elapsed(),
                    });
                    return Err(RpcError::TimedOut {
                        queue: envelope.work_queue.clone(),
                        timeout,
                    });
                }
            }
        }
    }

    /// Resolve a delivery from a reply channel against the registry.
    async fn route_reply(&self, delivery: Delivery, started: Instant) {
        let reply = match ReplyEnvelope::from_message(&delivery.message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    error = %e,
                    "Discarding undecodable reply"
                );
                if let Err(e) = delivery.reject(false).await {
                    debug!(error = %e, "Failed to reject undecodable reply");
                }
                return;
            }
        };

        if let Err(e) = delivery.ack().await {
            debug!(error = %e, "Failed to ack reply");
        }

        let token = reply.correlation_token;
        let task_kind = reply.task_kind.clone();
        let success = reply.outcome.is_success();

        if self.registry.resolve(reply) {
            self.sink.record(&LifecycleEvent::ReplyReceived {
                token,
                task_kind,
                success,
                elapsed: started.elapsed(),
            });
        } else {
            self.sink.record(&LifecycleEvent::ReplyDropped { token });
        }
    }
}
