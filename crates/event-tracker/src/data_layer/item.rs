// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventData;

/// Lifetime of a data layer item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Expiry {
    /// Removed when a new session starts.
    Session,
    /// Dropped the next time the store is loaded.
    UntilRestart,
    Forever,
    At(DateTime<Utc>),
    /// Relative expiry, resolved to [`Expiry::At`] when the item is added.
    AfterCustom(Duration),
}

impl Expiry {
    pub fn after(duration: Duration, now: DateTime<Utc>) -> Self {
        match chrono::Duration::from_std(duration) {
            Ok(delta) => now
                .checked_add_signed(delta)
                .map_or(Expiry::Forever, Expiry::At),
            Err(_) => Expiry::Forever,
        }
    }

    /// Turns relative expiries into absolute ones.
    pub fn resolve(self, now: DateTime<Utc>) -> Self {
        match self {
            Expiry::AfterCustom(duration) => Expiry::after(duration, now),
            other => other,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Expiry::At(at) if now >= *at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLayerItem {
    pub key: String,
    pub value: Value,
    pub expiry: Expiry,
}

/// Items keyed by name. Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<DataLayerItem>", into = "Vec<DataLayerItem>")]
pub struct DataLayerItems {
    items: BTreeMap<String, DataLayerItem>,
}

impl From<Vec<DataLayerItem>> for DataLayerItems {
    fn from(list: Vec<DataLayerItem>) -> Self {
        let mut items = DataLayerItems::default();
        for item in list {
            items.items.insert(item.key.clone(), item);
        }
        items
    }
}

impl From<DataLayerItems> for Vec<DataLayerItem> {
    fn from(items: DataLayerItems) -> Self {
        items.items.into_values().collect()
    }
}

impl DataLayerItems {
    /// Inserts or replaces the item under `key`, expiry included.
    pub fn insert(&mut self, key: &str, value: Value, expiry: Expiry, now: DateTime<Utc>) {
        let item = DataLayerItem {
            key: key.to_string(),
            value,
            expiry: expiry.resolve(now),
        };
        self.items.insert(key.to_string(), item);
    }

    pub fn get(&self, key: &str) -> Option<&DataLayerItem> {
        self.items.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<DataLayerItem> {
        self.items.remove(key)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes items whose `At` expiry has passed. Returns how many went.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.retain(|item| !item.expiry.is_expired(now))
    }

    pub fn remove_session_items(&mut self) -> usize {
        self.retain(|item| item.expiry != Expiry::Session)
    }

    pub fn remove_until_restart_items(&mut self) -> usize {
        self.retain(|item| item.expiry != Expiry::UntilRestart)
    }

    fn retain(&mut self, keep: impl Fn(&DataLayerItem) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|_, item| keep(item));
        before - self.items.len()
    }

    /// Values of every item that has not expired at `now`.
    pub fn values(&self, now: DateTime<Utc>) -> EventData {
        self.items
            .values()
            .filter(|item| !item.expiry.is_expired(now))
            .map(|item| (item.key.clone(), item.value.clone()))
            .collect()
    }
}
