// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Track and batch requests flowing through the pipeline.

use std::fmt::{self, Debug};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{BATCH_SHARED_KEYS, EVENT_KEY};
use crate::errors::TrackError;
use crate::util;

pub type EventData = serde_json::Map<String, Value>;

type CompletionFn = dyn Fn(Result<(), TrackError>) + Send + Sync;

/// Callback invoked once the fate of a track call is known.
#[derive(Clone)]
pub struct Completion(Arc<CompletionFn>);

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Result<(), TrackError>) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub fn complete(&self, result: Result<(), TrackError>) {
        (self.0)(result)
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Completion")
    }
}

/// A single track call. The completion callback is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
    #[serde(skip)]
    pub completion: Option<Completion>,
}

impl PartialEq for TrackEvent {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
            && self.timestamp == other.timestamp
            && self.data == other.data
    }
}

impl TrackEvent {
    pub fn new(data: EventData) -> Self {
        Self::new_at(data, Utc::now())
    }

    pub fn new_at(data: EventData, timestamp: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp,
            data,
            completion: None,
        }
    }

    /// Builds an event whose `tealium_event` attribute is `name`.
    pub fn named(name: &str, mut data: EventData) -> Self {
        data.insert(EVENT_KEY.to_string(), Value::String(name.to_string()));
        Self::new(data)
    }

    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn event_name(&self) -> Option<&str> {
        self.data.get(EVENT_KEY).and_then(Value::as_str)
    }

    /// Returns a copy carrying `extra` on top of the current payload.
    #[must_use]
    pub fn merged(&self, extra: &EventData) -> Self {
        let mut copy = self.clone();
        util::merge(&mut copy.data, extra);
        copy
    }
}

/// An ordered, non-empty group of events sent in one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub request_id: String,
    events: Vec<TrackEvent>,
    #[serde(skip)]
    pub completion: Option<Completion>,
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl BatchEvent {
    /// Returns `None` for an empty sequence.
    pub fn new(events: Vec<TrackEvent>) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            request_id: Uuid::new_v4().to_string(),
            events,
            completion: None,
        })
    }

    pub fn events(&self) -> &[TrackEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Payload in `{shared, events}` form: identity keys are taken from the
    /// first event and stripped from every event.
    pub fn compressed(&self) -> Value {
        let mut shared = EventData::new();
        if let Some(first) = self.events.first() {
            for key in BATCH_SHARED_KEYS {
                if let Some(value) = first.data.get(key) {
                    shared.insert(key.to_string(), value.clone());
                }
            }
        }
        let events = self
            .events
            .iter()
            .map(|event| {
                let stripped: EventData = event
                    .data
                    .iter()
                    .filter(|(key, _)| !BATCH_SHARED_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                Value::Object(stripped)
            })
            .collect::<Vec<_>>();
        serde_json::json!({ "shared": shared, "events": events })
    }
}

/// What the pipeline evaluates and what dispatchers send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum Dispatch {
    Track(TrackEvent),
    Batch(BatchEvent),
}

impl Dispatch {
    pub fn request_id(&self) -> &str {
        match self {
            Dispatch::Track(event) => &event.request_id,
            Dispatch::Batch(batch) => &batch.request_id,
        }
    }

    pub fn events(&self) -> &[TrackEvent] {
        match self {
            Dispatch::Track(event) => std::slice::from_ref(event),
            Dispatch::Batch(batch) => batch.events(),
        }
    }

    pub fn events_mut(&mut self) -> &mut [TrackEvent] {
        match self {
            Dispatch::Track(event) => std::slice::from_mut(event),
            Dispatch::Batch(batch) => &mut batch.events,
        }
    }

    pub fn into_events(self) -> Vec<TrackEvent> {
        match self {
            Dispatch::Track(event) => vec![event],
            Dispatch::Batch(batch) => batch.events,
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Merges `extra` into every contained event.
    pub fn merge(&mut self, extra: &EventData) {
        for event in self.events_mut() {
            util::merge(&mut event.data, extra);
        }
    }

    /// Body posted to the collect endpoint.
    pub fn payload(&self) -> Value {
        match self {
            Dispatch::Track(event) => Value::Object(event.data.clone()),
            Dispatch::Batch(batch) => batch.compressed(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Dispatch::Track(event) => format!(
                "event {} ({})",
                event.event_name().unwrap_or("<unnamed>"),
                event.request_id
            ),
            Dispatch::Batch(batch) => {
                format!("batch of {} ({})", batch.len(), batch.request_id)
            }
        }
    }
}
