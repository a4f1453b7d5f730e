// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedCacheItem {
    pub id: String,
    pub data: EventData,
    pub retrieval_date: DateTime<Utc>,
}

/// Bounded FIFO of lookup results. Oldest entries are evicted first.
#[derive(Debug, Clone, PartialEq)]
pub struct HostedCache {
    items: VecDeque<HostedCacheItem>,
    capacity: usize,
}

impl HostedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Restores persisted items, keeping the newest `capacity` of them.
    pub fn from_items(items: Vec<HostedCacheItem>, capacity: usize) -> Self {
        let mut cache = Self::new(capacity);
        for item in items {
            cache.insert(item);
        }
        cache
    }

    /// Appends `item`, replacing any entry with the same id and evicting the
    /// oldest entries beyond capacity.
    pub fn insert(&mut self, item: HostedCacheItem) {
        self.items.retain(|existing| existing.id != item.id);
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn get(&self, id: &str) -> Option<&HostedCacheItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Drops items retrieved at or before `reference - ttl`. Returns how many went.
    pub fn expire(&mut self, ttl: Duration, reference: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let Some(since) = reference.checked_sub_signed(ttl) else {
            return 0;
        };
        let before = self.items.len();
        self.items.retain(|item| item.retrieval_date > since);
        before - self.items.len()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn to_vec(&self) -> Vec<HostedCacheItem> {
        self.items.iter().cloned().collect()
    }
}
