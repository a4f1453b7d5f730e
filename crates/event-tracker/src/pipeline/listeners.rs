// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use crate::constants::REQUEST_UUID_KEY;
use crate::data_layer::{self, DataLayer};
use crate::event::Dispatch;
use crate::pipeline::{EvaluationContext, Listener};
use crate::util::{self, Shared};

/// Fills in data layer attributes the event does not set itself, with
/// timestamps taken from the event's creation time.
///
/// Listeners run when a request is released, so an event that waited in the
/// queue carries the data layer values (session id included) current at
/// release time, not at track time.
pub struct DataLayerEnrichment {
    data_layer: Shared<DataLayer>,
}

impl DataLayerEnrichment {
    pub fn new(data_layer: Shared<DataLayer>) -> Self {
        Self { data_layer }
    }
}

impl Listener for DataLayerEnrichment {
    fn id(&self) -> &str {
        "data_layer"
    }

    fn will_track(&mut self, request: &mut Dispatch, ctx: &EvaluationContext) {
        let values = util::lock(&self.data_layer).values(ctx.now);
        for event in request.events_mut() {
            util::merge_missing(&mut event.data, &values);
            util::merge_missing(&mut event.data, &data_layer::timestamps(event.timestamp));
        }
    }
}

/// Stamps each event with its request id.
pub struct RequestBookkeeping;

impl Listener for RequestBookkeeping {
    fn id(&self) -> &str {
        "request_bookkeeping"
    }

    fn will_track(&mut self, request: &mut Dispatch, _ctx: &EvaluationContext) {
        for event in request.events_mut() {
            let id = Value::String(event.request_id.clone());
            event.data.entry(REQUEST_UUID_KEY).or_insert(id);
        }
    }
}
