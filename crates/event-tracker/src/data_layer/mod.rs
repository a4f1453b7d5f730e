// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Expiring, persisted key-value attributes merged into every event.
//!
//! The data layer combines three sources, later ones winning on key clashes:
//! static identity attributes computed once per instance, persisted items and
//! read-time timestamps. Every mutation is written through to the store. A
//! failed write is logged and retried on the next mutation; the in-memory view
//! stays authoritative either way.

pub mod item;
pub mod migration;
pub mod session;

use std::sync::Arc;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::constants::{
    ACCOUNT_KEY, APP_UUID_KEY, DATA_SOURCE_KEY, ENVIRONMENT_KEY, LIBRARY_NAME,
    LIBRARY_NAME_KEY, LIBRARY_VERSION, LIBRARY_VERSION_KEY, ORIGIN_KEY, ORIGIN_MOBILE,
    PROFILE_KEY, RANDOM_KEY, SESSION_ID_KEY, TIMESTAMP_EPOCH_KEY, TIMESTAMP_KEY,
    TIMESTAMP_LOCAL_KEY, TIMESTAMP_OFFSET_KEY, TIMESTAMP_UNIX_KEY,
    TIMESTAMP_UNIX_MILLISECONDS_KEY, VISITOR_ID_KEY,
};
use crate::event::EventData;
use crate::storage::{self, PersistentStore, DATA_LAYER_KEY};
use crate::util;

pub use item::{DataLayerItem, DataLayerItems, Expiry};
use session::SessionState;

pub struct DataLayer {
    store: Arc<dyn PersistentStore>,
    items: DataLayerItems,
    static_data: EventData,
    session: SessionState,
    minutes_between_session: u64,
    seconds_between_track: u64,
    session_counting_enabled: bool,
    dirty: bool,
    /// Set while the legacy blob has been imported but the items are not saved yet.
    legacy_pending: bool,
}

impl DataLayer {
    pub fn new(config: &Config, store: Arc<dyn PersistentStore>, now: DateTime<Utc>) -> Self {
        let (mut items, legacy_pending) = load_items(store.as_ref(), now);
        let discarded = items.remove_until_restart_items() + items.remove_expired(now);
        if discarded > 0 {
            debug!("Discarded {discarded} data layer items on load");
        }

        let mut data_layer = DataLayer {
            store,
            items,
            static_data: static_attributes(config),
            session: SessionState::default(),
            minutes_between_session: config.minutes_between_session,
            seconds_between_track: config.seconds_between_track_events,
            session_counting_enabled: config.session_counting_enabled,
            dirty: discarded > 0 || legacy_pending,
            legacy_pending,
        };
        data_layer.ensure_visitor_identity(now);
        data_layer.persist_if_dirty();
        data_layer
    }

    pub fn update_config(&mut self, config: &Config) {
        self.static_data = static_attributes_with_random(
            config,
            self.static_data.get(RANDOM_KEY).cloned(),
        );
        self.minutes_between_session = config.minutes_between_session;
        self.seconds_between_track = config.seconds_between_track_events;
        self.session_counting_enabled = config.session_counting_enabled;
    }

    /// Adds every entry of `data` with the same expiry.
    pub fn add(&mut self, data: EventData, expiry: Expiry, now: DateTime<Utc>) {
        for (key, value) in data {
            self.items.insert(&key, value, expiry.clone(), now);
        }
        self.persist();
    }

    pub fn add_value(&mut self, key: &str, value: Value, expiry: Expiry, now: DateTime<Utc>) {
        self.items.insert(key, value, expiry, now);
        self.persist();
    }

    pub fn delete<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.items.remove(key.as_ref());
        }
        self.persist();
    }

    pub fn delete_all(&mut self) {
        self.items.clear();
        self.persist();
    }

    /// Removes `key` and returns its value if it had not expired.
    pub fn take(&mut self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let item = self.items.remove(key)?;
        self.persist();
        (!item.expiry.is_expired(now)).then_some(item.value)
    }

    /// Static attributes followed by unexpired items. No timestamps.
    pub fn values(&mut self, now: DateTime<Utc>) -> EventData {
        self.remove_expired(now);
        let mut all = self.static_data.clone();
        util::merge(&mut all, &self.items.values(now));
        all
    }

    /// Everything an event would be enriched with if tracked at `now`.
    pub fn all(&mut self, now: DateTime<Utc>) -> EventData {
        let mut all = self.values(now);
        util::merge(&mut all, &timestamps(now));
        all
    }

    pub fn remove_expired(&mut self, now: DateTime<Utc>) {
        if self.items.remove_expired(now) > 0 {
            self.persist();
        } else {
            self.persist_if_dirty();
        }
    }

    pub fn session_id(&mut self, now: DateTime<Utc>) -> Option<String> {
        self.remove_expired(now);
        self.items
            .get(SESSION_ID_KEY)
            .and_then(|item| util::scalar_to_string(&item.value))
    }

    /// Stores `id` with an expiry pushed `minutes_between_session` into the future.
    pub fn set_session_id(&mut self, id: &str, now: DateTime<Utc>) {
        let lifetime = std::time::Duration::from_secs(self.minutes_between_session * 60);
        self.add_value(
            SESSION_ID_KEY,
            Value::String(id.to_string()),
            Expiry::after(lifetime, now),
            now,
        );
    }

    /// Drops session items and starts a new session keyed on the current time.
    pub fn refresh_session_data(&mut self, now: DateTime<Utc>) {
        let removed = self.items.remove_session_items();
        debug!("Starting new session, removed {removed} session items");
        self.set_session_id(&now.timestamp_millis().to_string(), now);
        self.session.session_request_pending = true;
    }

    /// Called on every track call. Extends or renews the session and returns the
    /// session id when the remote session start call is due.
    pub fn refresh_session(&mut self, now: DateTime<Utc>) -> Option<String> {
        let start = match self.session_id(now) {
            None => {
                let start = self.session.track_count != 0 && self.record_track(now);
                self.refresh_session_data(now);
                start
            }
            Some(existing) => {
                let start = self.record_track(now);
                self.set_session_id(&existing, now);
                start
            }
        };
        if start && self.session_counting_enabled {
            self.session_id(now)
        } else {
            None
        }
    }

    fn record_track(&mut self, now: DateTime<Utc>) -> bool {
        self.session.record_track(now, self.seconds_between_track)
    }

    pub fn session_started(&mut self) {
        self.session.session_started();
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session
    }

    fn ensure_visitor_identity(&mut self, now: DateTime<Utc>) {
        if self.items.get(APP_UUID_KEY).is_some() {
            return;
        }
        let uuid = Uuid::new_v4();
        let visitor_id = uuid.simple().to_string().to_uppercase();
        self.items
            .insert(APP_UUID_KEY, Value::String(uuid.to_string()), Expiry::Forever, now);
        self.items
            .insert(VISITOR_ID_KEY, Value::String(visitor_id), Expiry::Forever, now);
        self.dirty = true;
    }

    fn persist_if_dirty(&mut self) {
        if self.dirty {
            self.persist();
        }
    }

    fn persist(&mut self) {
        match storage::save_json(self.store.as_ref(), DATA_LAYER_KEY, &self.items) {
            Ok(()) => self.dirty = false,
            Err(err) => {
                warn!("Failed to persist data layer, will retry on next change: {err}");
                self.dirty = true;
                return;
            }
        }
        if self.legacy_pending {
            match migration::discard_legacy(self.store.as_ref()) {
                Ok(()) => self.legacy_pending = false,
                Err(err) => warn!("Failed to remove legacy data layer: {err}"),
            }
        }
    }
}

/// Loads the stored items, falling back to the legacy blob. The flag is set
/// when the items came from the legacy blob and still have to be saved.
fn load_items(store: &dyn PersistentStore, now: DateTime<Utc>) -> (DataLayerItems, bool) {
    match storage::retrieve_json::<DataLayerItems>(store, DATA_LAYER_KEY) {
        Ok(Some(items)) if !items.is_empty() => return (items, false),
        Ok(_) => {}
        Err(err) => warn!("Failed to load persisted data layer: {err}"),
    }
    match migration::migrate(store, now) {
        Ok(Some(items)) => {
            debug!("Migrated {} legacy data layer entries", items.len());
            (items, true)
        }
        Ok(None) => (DataLayerItems::default(), false),
        Err(err) => {
            warn!("Failed to migrate legacy data layer: {err}");
            (DataLayerItems::default(), false)
        }
    }
}

fn static_attributes(config: &Config) -> EventData {
    static_attributes_with_random(config, None)
}

fn static_attributes_with_random(config: &Config, random: Option<Value>) -> EventData {
    let mut data = EventData::new();
    data.insert(ACCOUNT_KEY.to_string(), Value::String(config.account.clone()));
    data.insert(PROFILE_KEY.to_string(), Value::String(config.profile.clone()));
    data.insert(
        ENVIRONMENT_KEY.to_string(),
        Value::String(config.environment.clone()),
    );
    if let Some(data_source) = &config.data_source {
        data.insert(DATA_SOURCE_KEY.to_string(), Value::String(data_source.clone()));
    }
    data.insert(LIBRARY_NAME_KEY.to_string(), Value::String(LIBRARY_NAME.to_string()));
    data.insert(
        LIBRARY_VERSION_KEY.to_string(),
        Value::String(LIBRARY_VERSION.to_string()),
    );
    data.insert(ORIGIN_KEY.to_string(), Value::String(ORIGIN_MOBILE.to_string()));
    data.insert(
        RANDOM_KEY.to_string(),
        random.unwrap_or_else(|| Value::String(random_digits())),
    );
    data
}

/// 15 random decimal digits.
fn random_digits() -> String {
    let n = Uuid::new_v4().as_u128() % 1_000_000_000_000_000;
    format!("{n:015}")
}

/// Timestamp attributes describing `at`.
pub fn timestamps(at: DateTime<Utc>) -> EventData {
    let local = at.with_timezone(&Local);
    let offset_hours = local.offset().local_minus_utc() / 3600;
    let mut data = EventData::new();
    data.insert(
        TIMESTAMP_EPOCH_KEY.to_string(),
        Value::String(at.timestamp().to_string()),
    );
    data.insert(
        TIMESTAMP_KEY.to_string(),
        Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    data.insert(
        TIMESTAMP_LOCAL_KEY.to_string(),
        Value::String(local.format("%Y-%m-%dT%H:%M:%S").to_string()),
    );
    data.insert(
        TIMESTAMP_OFFSET_KEY.to_string(),
        Value::String(offset_hours.to_string()),
    );
    data.insert(
        TIMESTAMP_UNIX_KEY.to_string(),
        Value::String(at.timestamp().to_string()),
    );
    data.insert(
        TIMESTAMP_UNIX_MILLISECONDS_KEY.to_string(),
        Value::String(at.timestamp_millis().to_string()),
    );
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::FlakyStore;
    use crate::storage::{save_json, MemoryStore, LEGACY_DATA_LAYER_KEY};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> Config {
        Config::new("acct", "main", "dev")
    }

    fn data(value: Value) -> EventData {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn all_contains_static_items_and_timestamps() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.add(data(json!({"user": "abc"})), Expiry::Forever, at(0));
        let all = data_layer.all(at(1));
        assert_eq!(all.get(ACCOUNT_KEY), Some(&json!("acct")));
        assert_eq!(all.get("user"), Some(&json!("abc")));
        assert_eq!(all.get(TIMESTAMP_UNIX_KEY), Some(&json!("1700000001")));
        assert_eq!(all.get(TIMESTAMP_KEY), Some(&json!("2023-11-14T22:13:21Z")));
        assert_eq!(all.get(RANDOM_KEY).and_then(Value::as_str).map(str::len), Some(15));
        assert!(all.contains_key(VISITOR_ID_KEY));
    }

    #[test]
    fn stored_keys_override_static_attributes() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.add_value(PROFILE_KEY, json!("override"), Expiry::Forever, at(0));
        assert_eq!(data_layer.values(at(0)).get(PROFILE_KEY), Some(&json!("override")));
    }

    #[test]
    fn expired_items_are_invisible() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.add_value("promo", json!("x"), Expiry::At(at(10)), at(0));
        assert!(data_layer.values(at(9)).contains_key("promo"));
        assert!(!data_layer.values(at(10)).contains_key("promo"));
        assert_eq!(data_layer.take("promo", at(20)), None);
    }

    #[test]
    fn delete_and_delete_all() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.add(data(json!({"a": 1, "b": 2, "c": 3})), Expiry::Forever, at(0));
        data_layer.delete(&["a", "b"]);
        let values = data_layer.values(at(0));
        assert!(!values.contains_key("a"));
        assert!(values.contains_key("c"));
        data_layer.delete_all();
        assert!(!data_layer.values(at(0)).contains_key("c"));
    }

    #[test]
    fn items_survive_reload_except_until_restart() {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let mut first = DataLayer::new(&config(), Arc::clone(&store), at(0));
        first.add_value("keep", json!([1, 2]), Expiry::Forever, at(0));
        first.add_value("session", json!("s"), Expiry::Session, at(0));
        first.add_value("volatile", json!("v"), Expiry::UntilRestart, at(0));
        first.add_value("soon", json!("t"), Expiry::At(at(5)), at(0));
        let uuid = first.values(at(0)).get(APP_UUID_KEY).cloned();

        let mut second = DataLayer::new(&config(), store, at(10));
        let values = second.values(at(10));
        assert_eq!(values.get("keep"), Some(&json!([1, 2])));
        assert!(values.contains_key("session"));
        assert!(!values.contains_key("volatile"));
        assert!(!values.contains_key("soon"));
        assert_eq!(values.get(APP_UUID_KEY).cloned(), uuid);
    }

    #[test]
    fn failed_write_is_retried_on_next_mutation() {
        let store = Arc::new(FlakyStore::default());
        let mut data_layer =
            DataLayer::new(&config(), Arc::clone(&store) as Arc<dyn PersistentStore>, at(0));
        store.set_failing(true);
        data_layer.add_value("a", json!(1), Expiry::Forever, at(0));
        assert!(data_layer.values(at(0)).contains_key("a"));

        store.set_failing(false);
        data_layer.add_value("b", json!(2), Expiry::Forever, at(0));
        let persisted: DataLayerItems =
            storage::retrieve_json(&store.inner, DATA_LAYER_KEY).unwrap().unwrap();
        assert!(persisted.get("a").is_some());
        assert!(persisted.get("b").is_some());
    }

    #[test]
    fn legacy_data_is_migrated() {
        let store = Arc::new(MemoryStore::new());
        save_json(store.as_ref(), LEGACY_DATA_LAYER_KEY, &json!({"legacy": "yes"})).unwrap();
        let mut data_layer = DataLayer::new(&config(), store, at(0));
        assert_eq!(data_layer.values(at(0)).get("legacy"), Some(&json!("yes")));
    }

    #[test]
    fn legacy_data_survives_failed_first_save() {
        let store = Arc::new(FlakyStore::default());
        save_json(&store.inner, LEGACY_DATA_LAYER_KEY, &json!({"user": "abc"})).unwrap();
        store.set_failing(true);
        let first =
            DataLayer::new(&config(), Arc::clone(&store) as Arc<dyn PersistentStore>, at(0));
        drop(first);
        assert!(store.inner.retrieve(LEGACY_DATA_LAYER_KEY).unwrap().is_some());

        store.set_failing(false);
        let mut second =
            DataLayer::new(&config(), Arc::clone(&store) as Arc<dyn PersistentStore>, at(1));
        assert_eq!(second.values(at(1)).get("user"), Some(&json!("abc")));
        assert!(store.inner.retrieve(LEGACY_DATA_LAYER_KEY).unwrap().is_none());
        let persisted: DataLayerItems =
            storage::retrieve_json(&store.inner, DATA_LAYER_KEY).unwrap().unwrap();
        assert!(persisted.get("user").is_some());
    }

    #[test]
    fn session_is_created_and_extended() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.add_value("cart", json!(3), Expiry::Session, at(0));
        assert!(data_layer.session_id(at(0)).is_none());

        data_layer.refresh_session(at(0));
        let first = data_layer.session_id(at(0)).unwrap();
        assert_eq!(first, at(0).timestamp_millis().to_string());
        assert!(!data_layer.values(at(0)).contains_key("cart"));
        assert!(data_layer.session_state().session_request_pending);

        // 20 minutes later the session is still alive and gets extended
        data_layer.refresh_session(at(20 * 60));
        assert_eq!(data_layer.session_id(at(45 * 60)), Some(first.clone()));

        // more than 30 minutes of inactivity expires it
        let later = at(20 * 60 + 31 * 60);
        assert!(data_layer.session_id(later).is_none());
        data_layer.refresh_session(later);
        assert_ne!(data_layer.session_id(later), Some(first));
    }

    #[test]
    fn session_start_is_requested_for_quick_tracks() {
        let mut config = config();
        config.session_counting_enabled = true;
        let mut data_layer = DataLayer::new(&config, Arc::new(MemoryStore::new()), at(0));
        assert_eq!(data_layer.refresh_session(at(0)), None);
        assert_eq!(data_layer.refresh_session(at(5)), None);
        let id = data_layer.refresh_session(at(6));
        assert_eq!(id, Some(at(0).timestamp_millis().to_string()));
        data_layer.session_started();
        assert!(!data_layer.session_state().session_request_pending);
        assert_eq!(data_layer.refresh_session(at(7)), None);
        assert_eq!(data_layer.refresh_session(at(8)), None);
    }

    #[test]
    fn custom_session_id() {
        let mut data_layer = DataLayer::new(&config(), Arc::new(MemoryStore::new()), at(0));
        data_layer.set_session_id("abc", at(0));
        assert_eq!(data_layer.session_id(at(60)), Some("abc".to_string()));
        let lifetime = Duration::from_secs(30 * 60);
        assert_eq!(
            data_layer.items.get(SESSION_ID_KEY).unwrap().expiry,
            Expiry::after(lifetime, at(0))
        );
    }
}
