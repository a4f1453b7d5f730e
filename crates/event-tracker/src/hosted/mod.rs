// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hosted data layer: events carrying a configured lookup id are held until the
//! record for that id has been fetched, then released with the record merged in.

pub mod cache;
pub mod retriever;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::constants::{HOSTED_DATA_LAYER_ERROR_KEY, QUEUE_REASON_PENDING_LOOKUP};
use crate::event::{Dispatch, EventData, TrackEvent};
use crate::pipeline::{EvaluationContext, QueueDecision, Validator};
use crate::storage::{self, PersistentStore, HOSTED_CACHE_KEY};
use crate::util;

pub use cache::{HostedCache, HostedCacheItem};
pub use retriever::{HttpLookupClient, LookupClient, LookupError};

pub const HOSTED_VALIDATOR_ID: &str = "hosted_data_layer";

/// Request ids remembered as already augmented.
const PROCESSED_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupJob {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The record was stored; queued events can be released.
    Cached,
    /// A result for an id that is already cached.
    Ignored,
    /// The id is now known to fail; queued events proceed without it.
    Failed,
    /// Transient failure; a later dequeue will fetch again.
    RetryLater,
}

pub struct HostedDataLayer {
    store: Arc<dyn PersistentStore>,
    cache: HostedCache,
    lookup_keys: HashMap<String, String>,
    base_url: String,
    expiry: Duration,
    max_retries: u32,
    failing: HashSet<String>,
    in_flight: HashSet<String>,
    attempts: HashMap<String, u32>,
    processed: VecDeque<String>,
    jobs: mpsc::UnboundedSender<LookupJob>,
}

impl HostedDataLayer {
    pub fn new(
        config: &Config,
        store: Arc<dyn PersistentStore>,
        jobs: mpsc::UnboundedSender<LookupJob>,
    ) -> Self {
        let items = match storage::retrieve_json::<Vec<HostedCacheItem>>(store.as_ref(), HOSTED_CACHE_KEY) {
            Ok(items) => items.unwrap_or_default(),
            Err(err) => {
                warn!("Failed to load hosted data layer cache: {err}");
                Vec::new()
            }
        };
        Self {
            store,
            cache: HostedCache::from_items(items, config.hosted_data_layer_cache_size),
            lookup_keys: config.hosted_data_layer_keys.clone(),
            base_url: base_url(config),
            expiry: config.hosted_data_layer_expiry,
            max_retries: config.hosted_data_layer_max_retries,
            failing: HashSet::new(),
            in_flight: HashSet::new(),
            attempts: HashMap::new(),
            processed: VecDeque::new(),
            jobs,
        }
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}{id}.json", self.base_url)
    }

    pub fn cache(&self) -> &HostedCache {
        &self.cache
    }

    pub fn is_failing(&self, id: &str) -> bool {
        self.failing.contains(id)
    }

    /// The lookup id carried by `event`, if its name has a configured key.
    pub fn lookup_id(&self, event: &TrackEvent) -> Option<String> {
        let key = self.lookup_keys.get(event.event_name()?)?;
        match event.data.get(key)? {
            Value::Array(values) => values.first().and_then(util::scalar_to_string),
            value => util::scalar_to_string(value),
        }
    }

    /// Applies a fetch result. Late results for cached ids are ignored.
    pub fn complete_lookup(
        &mut self,
        id: &str,
        result: Result<EventData, LookupError>,
        now: DateTime<Utc>,
    ) -> LookupOutcome {
        self.in_flight.remove(id);
        match result {
            Ok(_) if self.cache.contains(id) => {
                debug!("Ignoring late hosted data layer result for {id}");
                LookupOutcome::Ignored
            }
            Ok(data) => {
                info!("Hosted data layer record {id} retrieved");
                self.attempts.remove(id);
                self.cache.insert(HostedCacheItem {
                    id: id.to_string(),
                    data,
                    retrieval_date: now,
                });
                self.persist();
                LookupOutcome::Cached
            }
            Err(err) if err.is_terminal() => {
                warn!("Hosted data layer record {id} is unusable: {err}");
                self.failing.insert(id.to_string());
                LookupOutcome::Failed
            }
            Err(err) => {
                let attempts = self.attempts.entry(id.to_string()).or_insert(0);
                *attempts += 1;
                if *attempts >= self.max_retries {
                    error!("Giving up on hosted data layer record {id} after {attempts} attempts: {err}");
                    self.attempts.remove(id);
                    self.failing.insert(id.to_string());
                    LookupOutcome::Failed
                } else {
                    warn!("Hosted data layer lookup for {id} failed, will retry: {err}");
                    LookupOutcome::RetryLater
                }
            }
        }
    }

    fn remember_processed(&mut self, request_id: &str) {
        if self.processed.len() >= PROCESSED_LIMIT {
            self.processed.pop_front();
        }
        self.processed.push_back(request_id.to_string());
    }

    fn request_lookup(&mut self, id: &str) {
        if !self.in_flight.insert(id.to_string()) {
            return;
        }
        let job = LookupJob {
            id: id.to_string(),
            url: self.url_for(id),
        };
        if self.jobs.send(job).is_err() {
            error!("Lookup worker is gone, cannot fetch {id}");
            self.in_flight.remove(id);
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let removed = self.cache.expire(self.expiry, now);
        if removed > 0 {
            debug!("Expired {removed} hosted data layer records");
            self.persist();
        }
    }

    fn persist(&self) {
        if let Err(err) = storage::save_json(self.store.as_ref(), HOSTED_CACHE_KEY, &self.cache.to_vec()) {
            warn!("Failed to persist hosted data layer cache: {err}");
        }
    }
}

fn base_url(config: &Config) -> String {
    format!(
        "{}{}/{}/",
        config.hosted_data_layer_base_url, config.account, config.profile
    )
}

impl Validator for HostedDataLayer {
    fn id(&self) -> &str {
        HOSTED_VALIDATOR_ID
    }

    fn should_queue(&mut self, request: &Dispatch, ctx: &EvaluationContext) -> QueueDecision {
        let Dispatch::Track(event) = request else {
            return QueueDecision::pass();
        };
        if self.processed.contains(&event.request_id) {
            return QueueDecision::pass();
        }
        let Some(id) = self.lookup_id(event) else {
            return QueueDecision::pass();
        };
        if self.failing.contains(&id) {
            let mut extra = EventData::new();
            extra.insert(
                HOSTED_DATA_LAYER_ERROR_KEY.to_string(),
                Value::String(format!("Data layer item {id}.json does not exist")),
            );
            return QueueDecision::pass_with(extra);
        }

        self.expire(ctx.now);
        if let Some(item) = self.cache.get(&id) {
            let data = item.data.clone();
            self.remember_processed(&event.request_id);
            return QueueDecision::pass_with(data);
        }

        self.request_lookup(&id);
        QueueDecision::queue(QUEUE_REASON_PENDING_LOOKUP, None)
    }

    fn should_drop(&mut self, _request: &Dispatch, _ctx: &EvaluationContext) -> bool {
        false
    }

    fn should_purge(&mut self, _request: &Dispatch, _ctx: &EvaluationContext) -> bool {
        false
    }

    fn update_config(&mut self, config: &Config) {
        self.lookup_keys = config.hosted_data_layer_keys.clone();
        self.base_url = base_url(config);
        self.expiry = config.hosted_data_layer_expiry;
        self.max_retries = config.hosted_data_layer_max_retries;
        self.cache.set_capacity(config.hosted_data_layer_cache_size);
    }
}
