// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use crate::config::Config;
use crate::consent::AUDIT_EVENTS;
use crate::constants::QUEUE_REASON_BATCHING;
use crate::event::Dispatch;
use crate::pipeline::{EvaluationContext, QueueDecision, Validator};

pub const BATCHING_VALIDATOR_ID: &str = "batching";

/// Holds events back until a flushing dequeue releases them as batches.
pub struct BatchingValidator {
    active: bool,
    bypass: HashSet<String>,
}

impl BatchingValidator {
    pub fn new(config: &Config) -> Self {
        Self {
            active: config.batching_active(),
            bypass: bypass_keys(config),
        }
    }
}

fn bypass_keys(config: &Config) -> HashSet<String> {
    AUDIT_EVENTS
        .iter()
        .map(|name| name.to_string())
        .chain(config.batching_bypass_keys.iter().cloned())
        .collect()
}

impl Validator for BatchingValidator {
    fn id(&self) -> &str {
        BATCHING_VALIDATOR_ID
    }

    fn should_queue(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> QueueDecision {
        if !self.active || ctx.flush {
            return QueueDecision::pass();
        }
        let Dispatch::Track(event) = request else {
            return QueueDecision::pass();
        };
        match event.event_name() {
            Some(name) if !self.bypass.contains(name) => {
                QueueDecision::queue(QUEUE_REASON_BATCHING, None)
            }
            _ => QueueDecision::pass(),
        }
    }

    fn should_drop(&mut self, _request: &Dispatch, _ctx: &EvaluationContext) -> bool {
        false
    }

    fn should_purge(&mut self, _request: &Dispatch, _ctx: &EvaluationContext) -> bool {
        false
    }

    fn update_config(&mut self, config: &Config) {
        self.active = config.batching_active();
        self.bypass = bypass_keys(config);
    }
}
