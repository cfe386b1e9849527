// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation registry for in-flight calls.
//!
//! Every pending call owns exactly one entry, keyed by its correlation token.
//! The entry is removed when the reply is resolved, when the caller gives up,
//! or when the caller's [`PendingReply`] is dropped, whichever happens first.

use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::envelope::{CorrelationToken, ReplyEnvelope};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("correlation token {0} is already pending")]
    DuplicateToken(CorrelationToken),
}

struct PendingCall {
    sender: oneshot::Sender<ReplyEnvelope>,
    reply_channel: String,
    registered_at: Instant,
}

/// Pending calls keyed by correlation token.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<CorrelationToken, PendingCall>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call. The returned guard yields the reply and
    /// unregisters the call when dropped.
    pub fn register(
        &self,
        token: CorrelationToken,
        reply_channel: impl Into<String>,
    ) -> Result<PendingReply<'_>, RegistryError> {
        let (sender, receiver) = oneshot::channel();
        match self.pending.entry(token) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateToken(token)),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    sender,
                    reply_channel: reply_channel.into(),
                    registered_at: Instant::now(),
                });
                Ok(PendingReply {
                    registry: self,
                    token,
                    receiver,
                })
            }
        }
    }

    /// Hand a reply to its waiting caller.
    ///
    /// Returns false when no call with the reply's token is pending; the reply
    /// should then be discarded.
    pub fn resolve(&self, reply: ReplyEnvelope) -> bool {
        match self.pending.remove(&reply.correlation_token) {
            Some((_, call)) => call.sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a pending call without resolving it.
    pub fn remove(&self, token: &CorrelationToken) -> bool {
        self.pending.remove(token).is_some()
    }

    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.pending.contains_key(token)
    }

    pub fn reply_channel(&self, token: &CorrelationToken) -> Option<String> {
        self.pending
            .get(token)
            .map(|call| call.reply_channel.clone())
    }

    /// How long the call has been pending.
    pub fn pending_for(&self, token: &CorrelationToken) -> Option<std::time::Duration> {
        self.pending
            .get(token)
            .map(|call| call.registered_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The caller's side of a registered call.
pub struct PendingReply<'a> {
    registry: &'a CorrelationRegistry,
    token: CorrelationToken,
    pub(crate) receiver: oneshot::Receiver<ReplyEnvelope>,
}

impl PendingReply<'_> {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Take the reply if it has already been resolved.
    pub fn try_take(&mut self) -> Option<ReplyEnvelope> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.token);
    }
}
