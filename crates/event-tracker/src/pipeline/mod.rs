// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered validators and listeners every request passes through.
//!
//! A request is evaluated in three rounds across all validators, in
//! registration order: drop, purge, then queue. Any drop ends evaluation. A
//! purge asks the caller to clear the queue and evaluation continues. Queue
//! decisions are OR-ed; each validator's extra data is merged into the request
//! before the next validator sees it, so identically named keys are won by the
//! validator registered last. Requests that are neither dropped nor queued go
//! through the listeners before dispatch.

pub mod batching;
pub mod listeners;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::constants::QUEUE_REASON_KEY;
use crate::event::{Dispatch, EventData};
use crate::util;

const DEFAULT_QUEUE_REASON: &str = "queued";

/// Facts about the pass a request is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationContext {
    pub now: DateTime<Utc>,
    /// Set on dequeue passes that release held batches.
    pub flush: bool,
    pub queue_len: usize,
}

impl EvaluationContext {
    pub fn track(now: DateTime<Utc>, queue_len: usize) -> Self {
        Self {
            now,
            flush: false,
            queue_len,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDecision {
    pub queue: bool,
    /// Merged into the request whether or not it is queued.
    pub extra: Option<EventData>,
}

impl QueueDecision {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn pass_with(extra: EventData) -> Self {
        Self {
            queue: false,
            extra: Some(extra),
        }
    }

    /// Queues with `reason` recorded under `queue_reason`.
    pub fn queue(reason: &str, extra: Option<EventData>) -> Self {
        let mut extra = extra.unwrap_or_default();
        extra.insert(
            QUEUE_REASON_KEY.to_string(),
            Value::String(reason.to_string()),
        );
        Self {
            queue: true,
            extra: Some(extra),
        }
    }
}

pub trait Validator: Send {
    fn id(&self) -> &str;

    fn should_queue(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> QueueDecision;

    fn should_drop(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> bool;

    fn should_purge(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> bool;

    fn update_config(&mut self, _config: &Config) {}
}

pub trait Listener: Send {
    fn id(&self) -> &str;

    /// Called on requests about to be dispatched. May enrich the payload.
    fn will_track(&mut self, request: &mut Dispatch, ctx: &EvaluationContext);

    fn update_config(&mut self, _config: &Config) {}
}

/// Validator state that is also mutated outside the pipeline, such as the
/// consent engine receiving new preferences.
pub struct SharedValidator<V> {
    id: String,
    inner: Arc<Mutex<V>>,
}

impl<V: Validator> SharedValidator<V> {
    pub fn new(inner: Arc<Mutex<V>>) -> Self {
        let id = util::lock(&inner).id().to_string();
        Self { id, inner }
    }
}

impl<V: Validator> Validator for SharedValidator<V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn should_queue(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> QueueDecision {
        util::lock(&self.inner).should_queue(request, ctx)
    }

    fn should_drop(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> bool {
        util::lock(&self.inner).should_drop(request, ctx)
    }

    fn should_purge(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> bool {
        util::lock(&self.inner).should_purge(request, ctx)
    }

    fn update_config(&mut self, config: &Config) {
        util::lock(&self.inner).update_config(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Drop { request: Dispatch, validator: String },
    Queue { request: Dispatch, reason: String },
    Dispatch(Dispatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    /// Id of the first validator that asked for the queue to be purged.
    pub purge: Option<String>,
}

#[derive(Default)]
pub struct Pipeline {
    validators: Vec<Box<dyn Validator>>,
    listeners: Vec<Box<dyn Listener>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_validator(&mut self, validator: Box<dyn Validator>) {
        debug!("Registered validator {}", validator.id());
        self.validators.push(validator);
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        debug!("Registered listener {}", listener.id());
        self.listeners.push(listener);
    }

    pub fn validator_ids(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.id()).collect()
    }

    pub fn listener_ids(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.id()).collect()
    }

    pub fn update_config(&mut self, config: &Config) {
        for validator in &mut self.validators {
            validator.update_config(config);
        }
        for listener in &mut self.listeners {
            listener.update_config(config);
        }
    }

    pub fn evaluate(&mut self, request: Dispatch, ctx: &EvaluationContext) -> Evaluation {
        for validator in &mut self.validators {
            if validator.should_drop(&request, ctx) {
                info!(
                    "Dropping {} as requested by {}",
                    request.describe(),
                    validator.id()
                );
                return Evaluation {
                    decision: Decision::Drop {
                        validator: validator.id().to_string(),
                        request,
                    },
                    purge: None,
                };
            }
        }

        let mut purge = None;
        for validator in &mut self.validators {
            if validator.should_purge(&request, ctx) {
                info!("Queue purge requested by {}", validator.id());
                purge.get_or_insert_with(|| validator.id().to_string());
            }
        }

        let mut request = request;
        let mut queued_by = Vec::new();
        let mut reason = None;
        for validator in &mut self.validators {
            let decision = validator.should_queue(&request, ctx);
            if let Some(extra) = &decision.extra {
                request.merge(extra);
            }
            if decision.queue {
                queued_by.push(validator.id().to_string());
                if let Some(r) = decision
                    .extra
                    .as_ref()
                    .and_then(|extra| extra.get(QUEUE_REASON_KEY))
                    .and_then(Value::as_str)
                {
                    reason = Some(r.to_string());
                }
            }
        }

        if !queued_by.is_empty() {
            let reason = reason.unwrap_or_else(|| DEFAULT_QUEUE_REASON.to_string());
            info!(
                "Queueing {} as requested by {} ({reason})",
                request.describe(),
                queued_by.join(", ")
            );
            return Evaluation {
                decision: Decision::Queue { request, reason },
                purge,
            };
        }

        for listener in &mut self.listeners {
            listener.will_track(&mut request, ctx);
        }
        Evaluation {
            decision: Decision::Dispatch(request),
            purge,
        }
    }
}
