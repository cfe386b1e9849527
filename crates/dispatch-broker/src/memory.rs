// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker.
//!
//! [`MemoryBroker`] is the reference implementation of the [`Broker`] contract.
//! It backs the embedded runtime and the test suites; a networked broker is
//! expected to approximate its behaviour as closely as the underlying system
//! allows.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{Acker, Broker, BrokerError, Delivery, Subscription};
use crate::message::{HEADER_DEATH_QUEUE, HEADER_DEATH_REASON, Message, QueueOptions, Routed};

#[derive(Debug, Clone)]
struct Queued {
    message: Message,
    redelivered: bool,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Queued>,
    consumers: usize,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Inner {
    queues: DashMap<String, QueueState>,
    next_tag: AtomicU64,
}

impl Inner {
    fn pop_ready(self: &Arc<Self>, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let Some(queued) = state.ready.pop_front() else {
            return Ok(None);
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        state.unacked.insert(tag, queued.clone());
        drop(state);

        let acker: Arc<dyn Acker> = self.clone();
        Ok(Some(Delivery::new(
            tag,
            queue,
            queued.message,
            queued.redelivered,
            acker,
        )))
    }

    /// Take a delivery out of the unacked set, returning it with the queue's
    /// dead-letter target.
    fn settle(&self, queue: &str, tag: u64) -> Result<(Queued, Option<String>), BrokerError> {
        let mut state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let queued = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                tag,
            })?;

        Ok((queued, state.options.dead_letter_queue.clone()))
    }

    fn requeue(&self, queue: &str, mut queued: Queued) {
        queued.redelivered = true;
        match self.queues.get_mut(queue) {
            Some(mut state) => {
                state.ready.push_front(queued);
                state.notify.notify_one();
            }
            None => debug!(queue, "queue gone, dropping requeued message"),
        }
    }

    fn dead_letter(&self, source: &str, dead_letter_queue: Option<String>, queued: Queued) {
        let Some(dlq) = dead_letter_queue else {
            debug!(queue = source, "rejected message discarded (no dead-letter queue)");
            return;
        };

        let message = queued
            .message
            .with_header(HEADER_DEATH_REASON, "rejected")
            .with_header(HEADER_DEATH_QUEUE, source);

        match self.queues.get_mut(&dlq) {
            Some(mut state) => {
                state.ready.push_back(Queued {
                    message,
                    redelivered: false,
                });
                state.notify.notify_one();
                debug!(queue = source, dead_letter_queue = %dlq, "message dead-lettered");
            }
            None => warn!(
                queue = source,
                dead_letter_queue = %dlq,
                "dead-letter queue does not exist, message discarded"
            ),
        }
    }

    fn remove_queue(&self, name: &str) -> usize {
        match self.queues.remove(name) {
            Some((_, state)) => {
                state.notify.notify_waiters();
                state.ready.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Acker for Inner {
    async fn ack(&self, queue: &str, tag: u64) -> Result<(), BrokerError> {
        self.settle(queue, tag).map(|_| ())
    }

    async fn reject(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let (queued, dead_letter_queue) = self.settle(queue, tag)?;
        if requeue {
            self.requeue(queue, queued);
        } else {
            self.dead_letter(queue, dead_letter_queue, queued);
        }
        Ok(())
    }

    fn release(&self, queue: &str, tag: u64) {
        if let Ok((queued, _)) = self.settle(queue, tag) {
            self.requeue(queue, queued);
        }
    }
}

/// An in-process broker.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.inner.queues.len())
            .finish()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of delivered but unsettled messages on a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        match self.inner.queues.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let current = &existing.get().options;
                if current.exclusive || options.exclusive {
                    Err(BrokerError::ResourceLocked(name.to_string()))
                } else if *current != options {
                    Err(BrokerError::PreconditionFailed(name.to_string()))
                } else {
                    Ok(())
                }
            }
            Entry::Vacant(slot) => {
                debug!(queue = name, ?options, "queue declared");
                slot.insert(QueueState::new(options));
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<usize, BrokerError> {
        let purged = self.inner.remove_queue(name);
        debug!(queue = name, purged, "queue deleted");
        Ok(purged)
    }

    async fn publish(
        &self,
        queue: &str,
        message: Message,
        require_consumer: bool,
    ) -> Result<Routed, BrokerError> {
        let Some(mut state) = self.inner.queues.get_mut(queue) else {
            if require_consumer {
                return Err(BrokerError::NoConsumers(queue.to_string()));
            }
            debug!(queue, "no such queue, message dropped");
            return Ok(Routed::Dropped);
        };

        if require_consumer && state.consumers == 0 {
            return Err(BrokerError::NoConsumers(queue.to_string()));
        }

        state.ready.push_back(Queued {
            message,
            redelivered: false,
        });
        state.notify.notify_one();
        Ok(Routed::Queued)
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut state = self
            .inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        state.consumers += 1;
        drop(state);

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.inner.pop_ready(queue)
    }

    async fn message_count(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner
            .queues
            .get(queue)
            .map(|state| state.ready.len())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn consumer_count(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner
            .queues
            .get(queue)
            .map(|state| state.consumers)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn queue_exists(&self, queue: &str) -> bool {
        self.inner.queues.contains_key(queue)
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let notify = match self.inner.queues.get(&self.queue) {
                Some(state) => state.notify.clone(),
                None => return None,
            };

            // Register interest before checking so a publish in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.pop_ready(&self.queue) {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(_) => return None,
            }

            notified.await;
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let delete = match self.inner.queues.get_mut(&self.queue) {
            Some(mut state) => {
                state.consumers = state.consumers.saturating_sub(1);
                state.consumers == 0 && state.options.auto_delete
            }
            None => false,
        };

        if delete {
            self.inner.remove_queue(&self.queue);
            debug!(queue = %self.queue, "auto-delete queue removed");
        }
    }
}
