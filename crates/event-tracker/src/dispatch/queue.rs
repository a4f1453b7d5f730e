// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable FIFO of requests that could not be dispatched yet.
//!
//! The queue is bounded both in size (oldest entries are evicted first) and in
//! age (entries older than the configured number of days are discarded). Every
//! mutation is written through to the store; a failed write is logged and
//! retried on the next mutation.
//!
//! Entries released to the dispatchers stay in the stored record as in-flight
//! until the delivery settles. They are not counted, trimmed or re-evaluated
//! while in flight, and a restart turns them back into waiting entries.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{QUEUE_REASON_KEY, WAS_QUEUED_KEY};
use crate::event::Dispatch;
use crate::storage::{self, PersistentStore, QUEUE_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request: Dispatch,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Marks every contained event as queued, keeping a queue reason already set
    /// by a validator.
    pub fn new(mut request: Dispatch, reason: &str, now: DateTime<Utc>) -> Self {
        for event in request.events_mut() {
            event
                .data
                .entry(QUEUE_REASON_KEY)
                .or_insert_with(|| Value::String(reason.to_string()));
            event
                .data
                .insert(WAS_QUEUED_KEY.to_string(), Value::String("true".to_string()));
        }
        Self {
            request,
            reason: reason.to_string(),
            enqueued_at: now,
        }
    }
}

pub struct PersistentQueue {
    store: Arc<dyn PersistentStore>,
    entries: Vec<QueueEntry>,
    in_flight: Vec<QueueEntry>,
    limit: usize,
    expiration: Duration,
    dirty: bool,
}

impl PersistentQueue {
    /// Restores the persisted queue, discarding entries that expired while the
    /// process was down.
    pub fn load(
        store: Arc<dyn PersistentStore>,
        limit: usize,
        expiration_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = match storage::retrieve_json::<Vec<QueueEntry>>(store.as_ref(), QUEUE_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(err) => {
                warn!("Discarding unreadable dispatch queue: {err}");
                Vec::new()
            }
        };
        let mut queue = Self {
            store,
            entries,
            in_flight: Vec::new(),
            limit: limit.max(1),
            expiration: Duration::days(i64::from(expiration_days)),
            dirty: false,
        };
        let removed = queue.trim(now);
        if !removed.is_empty() {
            debug!("Removed {} stale queued requests", removed.len());
            queue.persist();
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn set_limits(&mut self, limit: usize, expiration_days: u32) {
        self.limit = limit.max(1);
        self.expiration = Duration::days(i64::from(expiration_days));
    }

    /// Appends `entry` and returns the entries evicted to stay within bounds.
    pub fn append(&mut self, entry: QueueEntry, now: DateTime<Utc>) -> Vec<QueueEntry> {
        self.entries.push(entry);
        let removed = self.trim(now);
        self.persist();
        removed
    }

    /// Takes every waiting entry in FIFO order for re-evaluation. The stored
    /// copy is left untouched until the entries are handed back to `restore`.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Puts `kept` back at the head of the queue, ahead of anything appended
    /// since they were drained, and holds `dispatched` as in-flight.
    pub fn restore(
        &mut self,
        mut kept: Vec<QueueEntry>,
        dispatched: Vec<QueueEntry>,
        now: DateTime<Utc>,
    ) -> Vec<QueueEntry> {
        kept.append(&mut self.entries);
        self.entries = kept;
        self.in_flight.extend(dispatched);
        let removed = self.trim(now);
        self.persist();
        removed
    }

    /// Forgets in-flight entries holding any of the given event request ids.
    /// Returns how many were removed.
    pub fn settle(&mut self, request_ids: &HashSet<String>) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|entry| {
            !entry
                .request
                .events()
                .iter()
                .any(|event| request_ids.contains(&event.request_id))
        });
        let settled = before - self.in_flight.len();
        if settled > 0 {
            self.persist();
        }
        settled
    }

    /// Removes every waiting entry. In-flight entries are left alone.
    pub fn clear(&mut self) -> Vec<QueueEntry> {
        let entries = std::mem::take(&mut self.entries);
        self.persist();
        entries
    }

    fn trim(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let cutoff = now - self.expiration;
        let (mut removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.enqueued_at < cutoff);
        self.entries = kept;
        if self.entries.len() > self.limit {
            let overflow = self.entries.len() - self.limit;
            removed.extend(self.entries.drain(..overflow));
        }
        removed
    }

    fn persist(&mut self) {
        let records: Vec<&QueueEntry> = self.in_flight.iter().chain(&self.entries).collect();
        match storage::save_json(self.store.as_ref(), QUEUE_KEY, &records) {
            Ok(()) => self.dirty = false,
            Err(err) => {
                warn!("Failed to persist dispatch queue: {err}");
                self.dirty = true;
            }
        }
    }

    /// Whether the last write failed and the stored queue is behind.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
