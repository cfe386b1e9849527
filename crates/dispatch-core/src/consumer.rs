// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work consumer.
//!
//! Takes call envelopes off a work queue, runs the transform for their task
//! kind and publishes the outcome to the caller's reply channel. Each message
//! is settled exactly once:
//!
//! - handled (success or business failure) and replied: ack
//! - undecodable, or the reply could not be published: reject without requeue,
//!   which moves the message to the dead-letter queue

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dispatch_broker::{Broker, BrokerError, Delivery, Subscription};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{CallEnvelope, CorrelationToken, Outcome, RemoteFailure, ReplyEnvelope};
use crate::events::{EventSink, LifecycleEvent, NoopSink};
use crate::transform::TransformRegistry;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Replied and acknowledged.
    Acked { success: bool },
    /// Rejected without requeue.
    DeadLettered { reason: String },
}

/// Consumes one work queue.
#[derive(Clone)]
pub struct WorkConsumer {
    broker: Arc<dyn Broker>,
    queue: String,
    transforms: Arc<TransformRegistry>,
    sink: Arc<dyn EventSink>,
}

impl WorkConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        transforms: Arc<TransformRegistry>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            transforms,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Subscribe to the work queue and spawn the consume loop.
    ///
    /// The subscription is active when this returns, so calls published
    /// afterwards find a consumer.
    pub async fn start(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BrokerError> {
        let subscription = self.broker.consume(&self.queue).await?;
        info!(queue = %self.queue, "Work consumer started");
        Ok(tokio::spawn(self.run(subscription, shutdown_rx)))
    }

    async fn run(
        self,
        mut subscription: Box<dyn Subscription>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                delivery = subscription.next_delivery() => match delivery {
                    Some(delivery) => {
                        self.handle_delivery(delivery).await;
                    }
                    None => {
                        warn!(queue = %self.queue, "Work queue deleted, consumer stopping");
                        break;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(queue = %self.queue, "Work consumer stopped");
    }

    /// Process one delivery and settle it.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Disposition {
        let token_hint: Option<CorrelationToken> = delivery
            .message
            .correlation_id()
            .and_then(|id| id.parse().ok());
        self.sink.record(&LifecycleEvent::CallReceived {
            token: token_hint,
            queue: self.queue.clone(),
        });

        let call = match CallEnvelope::from_message(&self.queue, &delivery.message) {
            Ok(call) => call,
            Err(e) => {
                return self
                    .dead_letter(delivery, token_hint, format!("undecodable call: {e}"))
                    .await;
            }
        };

        let outcome = self.execute(&call).await;
        let success = outcome.is_success();
        let reply = ReplyEnvelope::for_call(&call, outcome);

        let message = match reply.to_message() {
            Ok(message) => message,
            Err(e) => {
                return self
                    .dead_letter(
                        delivery,
                        Some(call.correlation_token),
                        format!("unencodable reply: {e}"),
                    )
                    .await;
            }
        };

        // A vanished reply channel means the caller gave up; the reply is dropped.
        if let Err(e) = self
            .broker
            .publish(&call.reply_channel, message, false)
            .await
        {
            return self
                .dead_letter(
                    delivery,
                    Some(call.correlation_token),
                    format!("reply publish failed: {e}"),
                )
                .await;
        }

        self.sink.record(&LifecycleEvent::CallReplied {
            token: call.correlation_token,
            queue: self.queue.clone(),
            task_kind: call.task_kind.clone(),
            success,
        });

        if let Err(e) = delivery.ack().await {
            warn!(token = %call.correlation_token, error = %e, "Failed to ack call");
        }
        Disposition::Acked { success }
    }

    async fn execute(&self, call: &CallEnvelope) -> Outcome {
        let Some(transform) = self.transforms.get(&call.task_kind) else {
            debug!(task_kind = %call.task_kind, "No transform registered");
            return Outcome::Error {
                error: RemoteFailure::new(
                    "UNKNOWN_TASK_KIND",
                    format!("no transform registered for task kind '{}'", call.task_kind),
                ),
            };
        };

        // A panicking transform is answered like any other failure; the
        // consumer and its delivery stay alive.
        match AssertUnwindSafe(transform.apply(call.payload.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Outcome::Success { result },
            Ok(Err(e)) => Outcome::Error { error: e.into() },
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(
                    token = %call.correlation_token,
                    task_kind = %call.task_kind,
                    panic = %detail,
                    "Transform panicked"
                );
                Outcome::Error {
                    error: RemoteFailure::new(
                        "TRANSFORM_PANICKED",
                        format!("transform '{}' panicked: {detail}", call.task_kind),
                    ),
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        token: Option<CorrelationToken>,
        reason: String,
    ) -> Disposition {
        self.sink.record(&LifecycleEvent::CallRejected {
            token,
            queue: self.queue.clone(),
            reason: reason.clone(),
        });
        if let Err(e) = delivery.reject(false).await {
            warn!(queue = %self.queue, error = %e, "Failed to reject call");
        }
        Disposition::DeadLettered { reason }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start `count` competing consumers on the same queue.
pub async fn start_consumers(
    consumer: &WorkConsumer,
    count: usize,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, BrokerError> {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        handles.push(consumer.clone().start(shutdown_rx.clone()).await?);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_broker::{MemoryBroker, Message, QueueOptions};
    use serde_json::json;

    use crate::dead_letter::DeadLetterPolicy;
    use crate::events::RecordingSink;

    async fn setup() -> (MemoryBroker, WorkConsumer, Arc<RecordingSink>) {
        let broker = MemoryBroker::new();
        DeadLetterPolicy::default()
            .declare(&broker, "work")
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::new());
        let consumer = WorkConsumer::new(
            Arc::new(broker.clone()),
            "work",
            Arc::new(TransformRegistry::with_builtins()),
        )
        .with_event_sink(sink.clone());
        (broker, consumer, sink)
    }

    /// Publish a call and open its reply channel, as a caller would.
    async fn publish_call(broker: &MemoryBroker, call: &CallEnvelope) -> Box<dyn Subscription> {
        broker
            .declare_queue(&call.reply_channel, QueueOptions::reply_channel())
            .await
            .unwrap();
        let replies = broker.consume(&call.reply_channel).await.unwrap();
        broker
            .publish("work", call.to_message().unwrap(), false)
            .await
            .unwrap();
        replies
    }

    #[tokio::test]
    async fn test_success_is_replied_and_acked() {
        let (broker, consumer, sink) = setup().await;
        let call = CallEnvelope::new("work", "uppercase", json!("hello world"));
        let mut replies = publish_call(&broker, &call).await;

        let delivery = broker.get("work").await.unwrap().unwrap();
        assert_eq!(
            consumer.handle_delivery(delivery).await,
            Disposition::Acked { success: true }
        );

        let reply = replies.next_delivery().await.unwrap();
        let reply_envelope = ReplyEnvelope::from_message(&reply.message).unwrap();
        assert_eq!(reply_envelope.correlation_token, call.correlation_token);
        assert_eq!(
            reply_envelope.outcome,
            Outcome::Success {
                result: json!("HELLO WORLD")
            }
        );
        reply.ack().await.unwrap();

        assert_eq!(broker.unacked_count("work"), 0);
        assert_eq!(broker.message_count("work_dlq").await.unwrap(), 0);
        assert_eq!(sink.names(), vec!["received", "replied"]);
    }

    #[tokio::test]
    async fn test_business_failure_is_replied_not_dead_lettered() {
        let (broker, consumer, _sink) = setup().await;
        let call = CallEnvelope::new("work", "uppercase", json!(42));
        let mut replies = publish_call(&broker, &call).await;

        let delivery = broker.get("work").await.unwrap().unwrap();
        assert_eq!(
            consumer.handle_delivery(delivery).await,
            Disposition::Acked { success: false }
        );

        let reply = replies.next_delivery().await.unwrap();
        let reply_envelope = ReplyEnvelope::from_message(&reply.message).unwrap();
        match reply_envelope.outcome {
            Outcome::Error { error } => assert_eq!(error.code, "INVALID_INPUT"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(broker.message_count("work_dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_kind_is_replied_as_error() {
        let (broker, consumer, _sink) = setup().await;
        let call = CallEnvelope::new("work", "teleport", json!({}));
        let mut replies = publish_call(&broker, &call).await;

        let delivery = broker.get("work").await.unwrap().unwrap();
        consumer.handle_delivery(delivery).await;

        let reply = replies.next_delivery().await.unwrap();
        let reply_envelope = ReplyEnvelope::from_message(&reply.message).unwrap();
        assert!(matches!(
            reply_envelope.outcome,
            Outcome::Error { ref error } if error.code == "UNKNOWN_TASK_KIND"
        ));
    }

    #[tokio::test]
    async fn test_panicking_transform_is_replied_as_error() {
        let broker = MemoryBroker::new();
        DeadLetterPolicy::default()
            .declare(&broker, "work")
            .await
            .unwrap();
        let mut registry = TransformRegistry::with_builtins();
        registry.register_fn("explode", |_| panic!("boom"));
        let consumer = WorkConsumer::new(Arc::new(broker.clone()), "work", Arc::new(registry));

        let call = CallEnvelope::new("work", "explode", json!({}));
        let mut replies = publish_call(&broker, &call).await;

        let delivery = broker.get("work").await.unwrap().unwrap();
        assert_eq!(
            consumer.handle_delivery(delivery).await,
            Disposition::Acked { success: false }
        );

        let reply = replies.next_delivery().await.unwrap();
        match ReplyEnvelope::from_message(&reply.message).unwrap().outcome {
            Outcome::Error { error } => {
                assert_eq!(error.code, "TRANSFORM_PANICKED");
                assert!(error.message.contains("boom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(broker.unacked_count("work"), 0);
        assert_eq!(broker.message_count("work").await.unwrap(), 0);
        assert_eq!(broker.message_count("work_dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered_once() {
        let (broker, consumer, sink) = setup().await;
        broker
            .publish("work", Message::new("not an envelope"), false)
            .await
            .unwrap();

        let delivery = broker.get("work").await.unwrap().unwrap();
        let disposition = consumer.handle_delivery(delivery).await;
        assert!(matches!(disposition, Disposition::DeadLettered { .. }));

        assert_eq!(broker.message_count("work").await.unwrap(), 0);
        assert_eq!(broker.unacked_count("work"), 0);
        assert_eq!(broker.message_count("work_dlq").await.unwrap(), 1);
        assert_eq!(sink.names(), vec!["received", "rejected"]);
    }

    #[tokio::test]
    async fn test_reply_to_vanished_channel_is_still_acked() {
        let (broker, consumer, _sink) = setup().await;
        let call = CallEnvelope::new("work", "double", json!(2));
        broker
            .publish("work", call.to_message().unwrap(), false)
            .await
            .unwrap();

        let delivery = broker.get("work").await.unwrap().unwrap();
        assert_eq!(
            consumer.handle_delivery(delivery).await,
            Disposition::Acked { success: true }
        );
        assert_eq!(broker.message_count("work_dlq").await.unwrap(), 0);
        assert!(!broker.queue_exists(&call.reply_channel).await);
    }

    #[tokio::test]
    async fn test_consumers_stop_on_shutdown() {
        let (broker, consumer, _sink) = setup().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = start_consumers(&consumer, 3, &shutdown_rx).await.unwrap();
        assert_eq!(broker.consumer_count("work").await.unwrap(), 3);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(2), handle)
                .await
                .expect("consumer should stop")
                .unwrap();
        }
        assert_eq!(broker.consumer_count("work").await.unwrap(), 0);
    }
}
