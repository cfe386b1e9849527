// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call and reply envelopes.
//!
//! The correlation token and reply channel travel as message properties
//! (`correlation_id`, `reply_to`); the task kind and payload travel in a JSON
//! body. Replies carry the same token and a tagged outcome:
//!
//! ```text
//! call:  {"task_kind":"uppercase","payload":"hello world"}
//! reply: {"task_kind":"uppercase","outcome":{"status":"success","result":"HELLO WORLD"}}
//!        {"task_kind":"uppercase","outcome":{"status":"error","error":{"code":"INVALID_INPUT","message":"..."}}}
//! ```

use std::fmt;
use std::str::FromStr;

use dispatch_broker::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Content type stamped on every envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Unique identifier linking a call to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    /// Generate a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Name of the private reply channel for a call.
pub fn reply_channel_name(token: &CorrelationToken) -> String {
    format!("reply_{token}")
}

/// Errors decoding an envelope from a broker message.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("message has no correlation id")]
    MissingCorrelationId,

    #[error("invalid correlation id '{0}'")]
    InvalidCorrelationId(String),

    #[error("message has no reply-to address")]
    MissingReplyTo,

    #[error("invalid envelope body: {0}")]
    Body(#[from] serde_json::Error),
}

fn token_from(message: &Message) -> Result<CorrelationToken, EnvelopeError> {
    let raw = message
        .correlation_id()
        .ok_or(EnvelopeError::MissingCorrelationId)?;
    raw.parse()
        .map_err(|_| EnvelopeError::InvalidCorrelationId(raw.to_string()))
}

#[derive(Serialize, Deserialize)]
struct CallBody {
    task_kind: String,
    payload: Value,
}

/// A request published to a work queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub correlation_token: CorrelationToken,
    pub reply_channel: String,
    pub work_queue: String,
    pub task_kind: String,
    pub payload: Value,
}

impl CallEnvelope {
    /// Build a call with a fresh token and its matching reply channel.
    pub fn new(
        work_queue: impl Into<String>,
        task_kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        let correlation_token = CorrelationToken::new();
        Self {
            reply_channel: reply_channel_name(&correlation_token),
            correlation_token,
            work_queue: work_queue.into(),
            task_kind: task_kind.into(),
            payload,
        }
    }

    pub fn to_message(&self) -> Result<Message, EnvelopeError> {
        let body = serde_json::to_vec(&CallBody {
            task_kind: self.task_kind.clone(),
            payload: self.payload.clone(),
        })?;
        Ok(Message::new(body)
            .with_correlation_id(self.correlation_token.to_string())
            .with_reply_to(self.reply_channel.clone())
            .with_content_type(CONTENT_TYPE_JSON))
    }

    /// Decode a call received from `work_queue`.
    pub fn from_message(work_queue: &str, message: &Message) -> Result<Self, EnvelopeError> {
        let correlation_token = token_from(message)?;
        let reply_channel = message
            .reply_to()
            .ok_or(EnvelopeError::MissingReplyTo)?
            .to_string();
        let body: CallBody = serde_json::from_slice(&message.body)?;
        Ok(Self {
            correlation_token,
            reply_channel,
            work_queue: work_queue.to_string(),
            task_kind: body.task_kind,
            payload: body.payload,
        })
    }
}

/// A failure reported by the worker that handled a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub code: String,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Result of executing a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { result: Value },
    Error { error: RemoteFailure },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    task_kind: String,
    outcome: Outcome,
}

/// A reply published to a caller's reply channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub correlation_token: CorrelationToken,
    pub task_kind: String,
    pub outcome: Outcome,
}

impl ReplyEnvelope {
    /// Build the reply to `call`.
    pub fn for_call(call: &CallEnvelope, outcome: Outcome) -> Self {
        Self {
            correlation_token: call.correlation_token,
            task_kind: call.task_kind.clone(),
            outcome,
        }
    }

    pub fn to_message(&self) -> Result<Message, EnvelopeError> {
        let body = serde_json::to_vec(&ReplyBody {
            task_kind: self.task_kind.clone(),
            outcome: self.outcome.clone(),
        })?;
        Ok(Message::new(body)
            .with_correlation_id(self.correlation_token.to_string())
            .with_content_type(CONTENT_TYPE_JSON))
    }

    pub fn from_message(message: &Message) -> Result<Self, EnvelopeError> {
        let correlation_token = token_from(message)?;
        let body: ReplyBody = serde_json::from_slice(&message.body)?;
        Ok(Self {
            correlation_token,
            task_kind: body.task_kind,
            outcome: body.outcome,
        })
    }
}
