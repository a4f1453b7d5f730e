// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::event::EventData;

/// State owned by the service task and shared with the pipeline stages that read it.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Every holder runs on the service task, so a poisoned lock only means an
/// earlier panic in a test; the data is still the latest written state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Merges `from` into `into`, overwriting keys that already exist.
pub fn merge(into: &mut EventData, from: &EventData) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}

/// Merges `from` into `into` without touching keys `into` already has.
pub fn merge_missing(into: &mut EventData, from: &EventData) {
    for (key, value) in from {
        if !into.contains_key(key) {
            into.insert(key.clone(), value.clone());
        }
    }
}

/// Converts a scalar payload value into the string form used for lookups.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
