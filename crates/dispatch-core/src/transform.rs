// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transforms executed by work consumers, keyed by task kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Number, Value, json};
use thiserror::Error;

use crate::envelope::RemoteFailure;

/// Task kind used when a request does not name one.
pub const DEFAULT_TASK_KIND: &str = "data";

/// A business failure raised by a transform. Replied to the caller, never
/// dead-lettered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct TransformError {
    pub code: String,
    pub message: String,
}

impl TransformError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("INVALID_INPUT", message)
    }
}

impl From<TransformError> for RemoteFailure {
    fn from(err: TransformError) -> Self {
        RemoteFailure::new(err.code, err.message)
    }
}

/// Work performed for one task kind.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, payload: Value) -> Result<Value, TransformError>;
}

/// Adapts a plain function into a [`Transform`].
pub struct FnTransform<F>(pub F);

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(Value) -> Result<Value, TransformError> + Send + Sync,
{
    async fn apply(&self, payload: Value) -> Result<Value, TransformError> {
        (self.0)(payload)
    }
}

/// Transforms by task kind.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in transforms:
    ///
    /// | kind        | input            | result                                   |
    /// |-------------|------------------|------------------------------------------|
    /// | `uppercase` | string           | upper-cased string                       |
    /// | `reverse`   | string or array  | reversed                                 |
    /// | `double`    | number           | `n * 2`                                  |
    /// | `square`    | number           | `n * n`                                  |
    /// | `sort`      | array            | sorted numbers or strings                |
    /// | `data`      | anything         | generic processing (see [`process_data`])|
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_fn("uppercase", uppercase);
        registry.register_fn("reverse", reverse);
        registry.register_fn("double", double);
        registry.register_fn("square", square);
        registry.register_fn("sort", sort);
        registry.register_fn(DEFAULT_TASK_KIND, process_data);
        registry
    }

    pub fn register(&mut self, task_kind: impl Into<String>, transform: Arc<dyn Transform>) {
        self.transforms.insert(task_kind.into(), transform);
    }

    pub fn register_fn<F>(&mut self, task_kind: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.register(task_kind, Arc::new(FnTransform(f)));
    }

    pub fn get(&self, task_kind: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(task_kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.transforms.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

fn expect_str<'a>(payload: &'a Value, kind: &str) -> Result<&'a str, TransformError> {
    payload
        .as_str()
        .ok_or_else(|| TransformError::invalid_input(format!("{kind} expects a string")))
}

fn uppercase(payload: Value) -> Result<Value, TransformError> {
    Ok(Value::String(expect_str(&payload, "uppercase")?.to_uppercase()))
}

fn reverse(payload: Value) -> Result<Value, TransformError> {
    match payload {
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        Value::Array(mut items) => {
            items.reverse();
            Ok(Value::Array(items))
        }
        _ => Err(TransformError::invalid_input(
            "reverse expects a string or an array",
        )),
    }
}

fn arithmetic(
    payload: &Value,
    kind: &str,
    int_op: fn(i64) -> Option<i64>,
    float_op: fn(f64) -> f64,
) -> Result<Value, TransformError> {
    let Value::Number(number) = payload else {
        return Err(TransformError::invalid_input(format!(
            "{kind} expects a number"
        )));
    };

    if let Some(n) = number.as_i64()
        && let Some(result) = int_op(n)
    {
        return Ok(Value::Number(result.into()));
    }

    let n = number
        .as_f64()
        .ok_or_else(|| TransformError::invalid_input(format!("{kind} expects a number")))?;
    Number::from_f64(float_op(n))
        .map(Value::Number)
        .ok_or_else(|| TransformError::new("OUT_OF_RANGE", format!("{kind} result is not finite")))
}

fn double(payload: Value) -> Result<Value, TransformError> {
    arithmetic(&payload, "double", |n| n.checked_mul(2), |n| n * 2.0)
}

fn square(payload: Value) -> Result<Value, TransformError> {
    arithmetic(&payload, "square", |n| n.checked_mul(n), |n| n * n)
}

fn sort(payload: Value) -> Result<Value, TransformError> {
    let Value::Array(mut items) = payload else {
        return Err(TransformError::invalid_input("sort expects an array"));
    };

    if items.iter().all(Value::is_number) {
        items.sort_by(|a, b| {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        });
    } else if items.iter().all(Value::is_string) {
        items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    } else {
        return Err(TransformError::invalid_input(
            "sort expects an array of only numbers or only strings",
        ));
    }
    Ok(Value::Array(items))
}

/// Generic processing:
///
/// - strings and numbers become `"Processed: <value>"`
/// - arrays become `{"items": [...], "count": n, "processed": true}`
/// - objects gain `"processed": true` and `"keys_count": n`
/// - anything else becomes `{"value": ..., "processed": true}`
pub fn process_data(payload: Value) -> Result<Value, TransformError> {
    Ok(match payload {
        Value::String(s) => Value::String(format!("Processed: {s}")),
        Value::Number(n) => Value::String(format!("Processed: {n}")),
        Value::Array(items) => json!({
            "count": items.len(),
            "items": items,
            "processed": true,
        }),
        Value::Object(fields) => {
            let keys_count = fields.len();
            let mut enriched = Map::with_capacity(keys_count + 2);
            enriched.extend(fields);
            enriched.insert("processed".to_string(), Value::Bool(true));
            enriched.insert("keys_count".to_string(), json!(keys_count));
            Value::Object(enriched)
        }
        other => json!({"value": other, "processed": true}),
    })
}
