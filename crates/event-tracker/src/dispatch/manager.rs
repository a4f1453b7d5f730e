// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides, for every track call and every dequeue, which requests leave for
//! the dispatchers now and which wait in the queue.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::queue::{PersistentQueue, QueueEntry};
use super::DispatchError;
use crate::config::Config;
use crate::constants::{
    QUEUE_REASON_DELIVERY_RETRY, QUEUE_REASON_KEY, QUEUE_REASON_NO_DISPATCHERS,
};
use crate::errors::TrackError;
use crate::event::{BatchEvent, Dispatch, TrackEvent};
use crate::pipeline::{Decision, EvaluationContext, Pipeline};
use crate::storage::PersistentStore;

/// What happened to a dispatched request once every dispatcher answered.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Put back in the queue; a dequeue should be scheduled.
    Requeued,
    Failed(DispatchError),
}

pub struct DispatchManager {
    pipeline: Pipeline,
    queue: PersistentQueue,
    batching_active: bool,
    batch_size: usize,
    dispatch_after: usize,
    dispatchers_ready: bool,
}

impl DispatchManager {
    pub fn new(
        config: &Config,
        pipeline: Pipeline,
        store: Arc<dyn PersistentStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let queue = PersistentQueue::load(
            store,
            config.dispatch_queue_limit,
            config.dispatch_expiration_days,
            now,
        );
        if !queue.is_empty() {
            info!("Restored {} queued requests", queue.len());
        }
        Self {
            pipeline,
            queue,
            batching_active: config.batching_active(),
            batch_size: config.batch_size.max(1),
            dispatch_after: config.dispatch_after.max(1),
            dispatchers_ready: false,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue(&self) -> &PersistentQueue {
        &self.queue
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Until dispatchers are ready every passing request is queued and dequeues
    /// are no-ops.
    pub fn set_dispatchers_ready(&mut self, ready: bool) {
        self.dispatchers_ready = ready;
    }

    pub fn update_config(&mut self, config: &Config, now: DateTime<Utc>) {
        self.batching_active = config.batching_active();
        self.batch_size = config.batch_size.max(1);
        self.dispatch_after = config.dispatch_after.max(1);
        self.queue
            .set_limits(config.dispatch_queue_limit, config.dispatch_expiration_days);
        self.pipeline.update_config(config);
        // apply the new bounds right away
        let entries = self.queue.drain();
        let evicted = self.queue.restore(entries, Vec::new(), now);
        complete_all(evicted, Err(TrackError::Expired));
    }

    /// Evaluates a fresh track call and returns the requests to send now.
    pub fn process_track(&mut self, event: TrackEvent, now: DateTime<Utc>) -> Vec<Dispatch> {
        let ctx = EvaluationContext::track(now, self.queue.len());
        let evaluation = self.pipeline.evaluate(Dispatch::Track(event), &ctx);
        if let Some(validator) = &evaluation.purge {
            self.purge(validator);
        }

        match evaluation.decision {
            Decision::Drop { request, .. } => {
                complete(request, Err(TrackError::Forbidden));
                Vec::new()
            }
            Decision::Queue { request, reason } => {
                self.enqueue(request, &reason, now);
                if self.batching_active && self.queue.len() >= self.dispatch_after {
                    debug!(
                        "Queue reached {} requests, flushing",
                        self.dispatch_after
                    );
                    return self.handle_dequeue_request("dispatch limit reached", true, now);
                }
                Vec::new()
            }
            Decision::Dispatch(request) if !self.dispatchers_ready => {
                self.enqueue(request, QUEUE_REASON_NO_DISPATCHERS, now);
                Vec::new()
            }
            Decision::Dispatch(request) => vec![request],
        }
    }

    /// Re-evaluates every queued request in FIFO order. Entries that now pass
    /// are returned, grouped into batches when batching is active, and stay
    /// stored as in-flight until `handle_dispatch_result` settles them.
    pub fn handle_dequeue_request(
        &mut self,
        reason: &str,
        flush: bool,
        now: DateTime<Utc>,
    ) -> Vec<Dispatch> {
        if !self.dispatchers_ready {
            debug!("Ignoring dequeue ({reason}): no dispatchers ready");
            return Vec::new();
        }
        if self.queue.is_empty() {
            return Vec::new();
        }
        info!("Releasing {} queued requests: {reason}", self.queue.len());

        let entries = self.queue.drain();
        let ctx = EvaluationContext {
            now,
            flush,
            queue_len: entries.len(),
        };
        let mut kept = Vec::new();
        let mut dispatched = Vec::new();
        let mut passing = Vec::new();
        let mut purge = None;
        for entry in entries {
            let evaluation = self.pipeline.evaluate(entry.request.clone(), &ctx);
            if purge.is_none() {
                purge = evaluation.purge;
            }
            match evaluation.decision {
                Decision::Drop { request, .. } => complete(request, Err(TrackError::Forbidden)),
                Decision::Queue { request, reason } => kept.push(QueueEntry {
                    request,
                    reason,
                    enqueued_at: entry.enqueued_at,
                }),
                Decision::Dispatch(request) => {
                    passing.extend(request.into_events());
                    dispatched.push(entry);
                }
            }
        }

        if let Some(validator) = purge {
            info!(
                "Purging {} queued requests as requested by {validator}",
                kept.len()
            );
            for entry in kept.drain(..) {
                complete(entry.request, Err(TrackError::Purged));
            }
        }
        let evicted = self.queue.restore(kept, dispatched, now);
        complete_all(evicted, Err(TrackError::Expired));

        self.group(passing)
    }

    /// Applies the dispatchers' verdicts on `request`. Requeued events are
    /// written back before their in-flight entries are forgotten.
    pub fn handle_dispatch_result(
        &mut self,
        request: Dispatch,
        results: Vec<(String, Result<(), DispatchError>)>,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let request_ids: HashSet<String> = request
            .events()
            .iter()
            .map(|event| event.request_id.clone())
            .collect();
        if results.is_empty() {
            self.requeue(request, QUEUE_REASON_NO_DISPATCHERS, now);
            self.queue.settle(&request_ids);
            return DeliveryOutcome::Requeued;
        }
        if results.iter().any(|(_, result)| result.is_ok()) {
            debug!("Delivered {}", request.describe());
            self.queue.settle(&request_ids);
            complete(request, Ok(()));
            return DeliveryOutcome::Delivered;
        }
        let retryable = results
            .iter()
            .any(|(_, result)| result.as_ref().is_err_and(DispatchError::is_retryable));
        if retryable {
            warn!("Delivery of {} failed, requeueing", request.describe());
            self.requeue(request, QUEUE_REASON_DELIVERY_RETRY, now);
            self.queue.settle(&request_ids);
            return DeliveryOutcome::Requeued;
        }

        let err = results
            .into_iter()
            .find_map(|(_, result)| result.err())
            .unwrap_or(DispatchError::Payload("no dispatcher result".to_string()));
        warn!("Delivery of {} failed permanently: {err}", request.describe());
        self.queue.settle(&request_ids);
        complete(request, Err(TrackError::Delivery(err.clone())));
        DeliveryOutcome::Failed(err)
    }

    fn enqueue(&mut self, request: Dispatch, reason: &str, now: DateTime<Utc>) {
        debug!("Queueing {} ({reason})", request.describe());
        let evicted = self.queue.append(QueueEntry::new(request, reason, now), now);
        if !evicted.is_empty() {
            warn!("Dispatch queue full, evicted {} requests", evicted.len());
        }
        complete_all(evicted, Err(TrackError::Expired));
    }

    /// Batches are split back into single events so a later dequeue can regroup
    /// them with whatever else is waiting.
    fn requeue(&mut self, request: Dispatch, reason: &str, now: DateTime<Utc>) {
        for mut event in request.into_events() {
            event.data.insert(
                QUEUE_REASON_KEY.to_string(),
                Value::String(reason.to_string()),
            );
            self.enqueue(Dispatch::Track(event), reason, now);
        }
    }

    fn purge(&mut self, validator: &str) {
        let entries = self.queue.clear();
        if !entries.is_empty() {
            info!(
                "Purging {} queued requests as requested by {validator}",
                entries.len()
            );
        }
        complete_all(entries, Err(TrackError::Purged));
    }

    fn group(&self, events: Vec<TrackEvent>) -> Vec<Dispatch> {
        if !self.batching_active {
            return events.into_iter().map(Dispatch::Track).collect();
        }
        let mut dispatches = Vec::new();
        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let mut chunk: Vec<TrackEvent> = events.by_ref().take(self.batch_size).collect();
            if chunk.len() == 1 {
                dispatches.extend(chunk.pop().map(Dispatch::Track));
            } else if let Some(batch) = BatchEvent::new(chunk) {
                dispatches.push(Dispatch::Batch(batch));
            }
        }
        dispatches
    }
}

fn complete(request: Dispatch, result: Result<(), TrackError>) {
    for event in request.into_events() {
        if let Some(completion) = &event.completion {
            completion.complete(result.clone());
        }
    }
}

fn complete_all(entries: Vec<QueueEntry>, result: Result<(), TrackError>) {
    for entry in entries {
        complete(entry.request, result.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WAS_QUEUED_KEY;
    use crate::event::{Completion, EventData};
    use crate::pipeline::batching::BatchingValidator;
    use crate::pipeline::tests::Fixed;
    use crate::pipeline::SharedValidator;
    use crate::storage::MemoryStore;
    use crate::util::{self, shared, Shared};
    use serde_json::json;
    use tracing_test::traced_test;

    type Results = Shared<Vec<(String, Result<(), TrackError>)>>;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn tracked(name: &str, results: &Results) -> TrackEvent {
        let results = results.clone();
        let label = name.to_string();
        TrackEvent::named(name, EventData::new()).with_completion(Completion::new(
            move |result| util::lock(&results).push((label.clone(), result)),
        ))
    }

    fn manager(config: &Config, pipeline: Pipeline) -> DispatchManager {
        let mut manager =
            DispatchManager::new(config, pipeline, Arc::new(MemoryStore::new()), now());
        manager.set_dispatchers_ready(true);
        manager
    }

    fn names(dispatches: &[Dispatch]) -> Vec<Vec<String>> {
        dispatches
            .iter()
            .map(|d| {
                d.events()
                    .iter()
                    .map(|e| e.event_name().unwrap_or_default().to_string())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn passing_track_is_dispatched() {
        let config = Config::new("acct", "main", "prod");
        let mut manager = manager(&config, Pipeline::new());
        let dispatches = manager.process_track(TrackEvent::named("view", EventData::new()), now());
        assert_eq!(names(&dispatches), vec![vec!["view"]]);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn dropped_track_completes_forbidden() {
        let config = Config::new("acct", "main", "prod");
        let mut dropper = Fixed::new("consent");
        dropper.drop = true;
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(dropper));
        let mut manager = manager(&config, pipeline);

        let results: Results = shared(Vec::new());
        assert!(manager.process_track(tracked("view", &results), now()).is_empty());
        assert_eq!(
            *util::lock(&results),
            vec![("view".to_string(), Err(TrackError::Forbidden))]
        );
    }

    #[test]
    fn queued_until_validator_releases() {
        let config = Config::new("acct", "main", "prod");
        let gate = shared(Fixed::new("gate"));
        util::lock(&gate).queue = true;
        util::lock(&gate).extra = Some(
            json!({"queue_reason": "consent"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(SharedValidator::new(gate.clone())));
        let mut manager = manager(&config, pipeline);

        assert!(manager
            .process_track(TrackEvent::named("a", EventData::new()), now())
            .is_empty());
        assert!(manager
            .process_track(TrackEvent::named("b", EventData::new()), now())
            .is_empty());
        assert_eq!(manager.queue_len(), 2);
        assert_eq!(manager.queue().entries()[0].reason, "consent");
        assert!(manager.handle_dequeue_request("test", true, now()).is_empty());
        assert_eq!(manager.queue_len(), 2);

        {
            let mut gate = util::lock(&gate);
            gate.queue = false;
            gate.extra = None;
        }
        let released = manager.handle_dequeue_request("consent granted", true, now());
        assert_eq!(names(&released), vec![vec!["a"], vec!["b"]]);
        let data = &released[0].events()[0].data;
        assert_eq!(data.get(WAS_QUEUED_KEY), Some(&json!("true")));
        assert_eq!(data.get(QUEUE_REASON_KEY), Some(&json!("consent")));
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    #[traced_test]
    fn purge_clears_queue_and_completes_entries() {
        let config = Config::new("acct", "main", "prod");
        let gate = shared(Fixed::new("gate"));
        util::lock(&gate).queue = true;
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(SharedValidator::new(gate.clone())));
        let mut manager = manager(&config, pipeline);

        let results: Results = shared(Vec::new());
        manager.process_track(tracked("a", &results), now());
        manager.process_track(tracked("b", &results), now());
        assert_eq!(manager.queue_len(), 2);

        util::lock(&gate).purge = true;
        manager.process_track(tracked("c", &results), now());
        // the purge happens before "c" itself is queued
        assert_eq!(manager.queue_len(), 1);
        assert!(logs_contain("Purging 2 queued requests as requested by gate"));
        assert_eq!(
            *util::lock(&results),
            vec![
                ("a".to_string(), Err(TrackError::Purged)),
                ("b".to_string(), Err(TrackError::Purged)),
            ]
        );
    }

    #[test]
    fn batches_released_when_dispatch_after_reached() {
        let config = Config::new("acct", "main", "prod").with_batching(3);
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(BatchingValidator::new(&config)));
        let mut manager = manager(&config, pipeline);

        for name in ["a", "b"] {
            assert!(manager
                .process_track(TrackEvent::named(name, EventData::new()), now())
                .is_empty());
        }
        let released = manager.process_track(TrackEvent::named("c", EventData::new()), now());
        assert_eq!(names(&released), vec![vec!["a", "b", "c"]]);
        assert!(matches!(released[0], Dispatch::Batch(_)));
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn flush_chunks_by_batch_size() {
        let mut config = Config::new("acct", "main", "prod").with_batching(2);
        config.dispatch_after = 10;
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(BatchingValidator::new(&config)));
        let mut manager = manager(&config, pipeline);

        for name in ["a", "b", "c"] {
            manager.process_track(TrackEvent::named(name, EventData::new()), now());
        }
        assert_eq!(manager.queue_len(), 3);
        // a non-flushing dequeue leaves batching in place
        assert!(manager.handle_dequeue_request("tick", false, now()).is_empty());

        let released = manager.handle_dequeue_request("flush", true, now());
        assert_eq!(names(&released), vec![vec!["a", "b"], vec!["c"]]);
        assert!(matches!(released[0], Dispatch::Batch(_)));
        assert!(matches!(released[1], Dispatch::Track(_)));
    }

    #[test]
    fn passing_requests_wait_for_dispatchers() {
        let config = Config::new("acct", "main", "prod");
        let mut manager =
            DispatchManager::new(&config, Pipeline::new(), Arc::new(MemoryStore::new()), now());
        assert!(manager
            .process_track(TrackEvent::named("a", EventData::new()), now())
            .is_empty());
        assert_eq!(
            manager.queue().entries()[0].reason,
            QUEUE_REASON_NO_DISPATCHERS
        );
        assert!(manager.handle_dequeue_request("early", true, now()).is_empty());

        manager.set_dispatchers_ready(true);
        let released = manager.handle_dequeue_request("dispatchers ready", true, now());
        assert_eq!(names(&released), vec![vec!["a"]]);
    }

    #[test]
    fn dispatch_results() {
        let config = Config::new("acct", "main", "prod");
        let mut manager = manager(&config, Pipeline::new());
        let results: Results = shared(Vec::new());
        let unavailable = || DispatchError::Destination {
            status: Some(503),
            message: "unavailable".to_string(),
        };
        let rejected = DispatchError::Destination {
            status: Some(400),
            message: "bad request".to_string(),
        };

        let outcome = manager.handle_dispatch_result(
            Dispatch::Track(tracked("ok", &results)),
            vec![
                ("a".to_string(), Err(unavailable())),
                ("b".to_string(), Ok(())),
            ],
            now(),
        );
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let outcome = manager.handle_dispatch_result(
            Dispatch::Track(tracked("retry", &results)),
            vec![("a".to_string(), Err(unavailable()))],
            now(),
        );
        assert_eq!(outcome, DeliveryOutcome::Requeued);
        assert_eq!(manager.queue().entries()[0].reason, QUEUE_REASON_DELIVERY_RETRY);

        let outcome = manager.handle_dispatch_result(
            Dispatch::Track(tracked("fail", &results)),
            vec![("a".to_string(), Err(rejected.clone()))],
            now(),
        );
        assert_eq!(outcome, DeliveryOutcome::Failed(rejected.clone()));

        assert_eq!(
            *util::lock(&results),
            vec![
                ("ok".to_string(), Ok(())),
                ("fail".to_string(), Err(TrackError::Delivery(rejected))),
            ]
        );
    }

    #[test]
    fn released_entries_stay_stored_until_delivery_settles() {
        let config = Config::new("acct", "main", "prod");
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let mut manager = DispatchManager::new(&config, Pipeline::new(), store.clone(), now());
        let results: Results = shared(Vec::new());
        manager.process_track(tracked("a", &results), now());
        manager.process_track(tracked("b", &results), now());
        assert_eq!(manager.queue_len(), 2);

        manager.set_dispatchers_ready(true);
        let mut released = manager.handle_dequeue_request("ready", true, now());
        assert_eq!(names(&released), vec![vec!["a"], vec!["b"]]);
        assert_eq!(manager.queue_len(), 0);
        assert_eq!(manager.queue().in_flight_len(), 2);
        let stored = |store: &Arc<dyn PersistentStore>| {
            PersistentQueue::load(store.clone(), 40, 7, now()).len()
        };
        assert_eq!(stored(&store), 2);

        let second = released.pop().unwrap();
        let first = released.pop().unwrap();
        let outcome =
            manager.handle_dispatch_result(first, vec![("a".to_string(), Ok(()))], now());
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(stored(&store), 1);

        let unavailable = DispatchError::Destination {
            status: Some(503),
            message: "unavailable".to_string(),
        };
        let outcome = manager.handle_dispatch_result(
            second,
            vec![("a".to_string(), Err(unavailable))],
            now(),
        );
        assert_eq!(outcome, DeliveryOutcome::Requeued);
        assert_eq!(manager.queue().in_flight_len(), 0);
        assert_eq!(manager.queue_len(), 1);
        assert_eq!(stored(&store), 1);
        assert_eq!(*util::lock(&results), vec![("a".to_string(), Ok(()))]);
    }

    #[test]
    fn queue_overflow_completes_evicted_entries() {
        let mut config = Config::new("acct", "main", "prod");
        config.dispatch_queue_limit = 2;
        let gate = shared(Fixed::new("gate"));
        util::lock(&gate).queue = true;
        let mut pipeline = Pipeline::new();
        pipeline.add_validator(Box::new(SharedValidator::new(gate)));
        let mut manager = manager(&config, pipeline);

        let results: Results = shared(Vec::new());
        for name in ["a", "b", "c"] {
            manager.process_track(tracked(name, &results), now());
        }
        assert_eq!(manager.queue_len(), 2);
        assert_eq!(
            *util::lock(&results),
            vec![("a".to_string(), Err(TrackError::Expired))]
        );
    }
}
