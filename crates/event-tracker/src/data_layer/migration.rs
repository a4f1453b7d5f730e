// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};

use super::item::{DataLayerItems, Expiry};
use crate::event::EventData;
use crate::storage::{self, PersistentStore, StoreError, LEGACY_DATA_LAYER_KEY};

/// Converts the flat pre-expiry map into current items. Entries never expire.
pub fn from_legacy(legacy: EventData, now: DateTime<Utc>) -> DataLayerItems {
    let mut items = DataLayerItems::default();
    for (key, value) in legacy {
        items.insert(&key, value, Expiry::Forever, now);
    }
    items
}

/// Reads the legacy blob, if one exists. The blob stays in the store until
/// `discard_legacy` is called once the imported items have been saved.
pub fn migrate(
    store: &dyn PersistentStore,
    now: DateTime<Utc>,
) -> Result<Option<DataLayerItems>, StoreError> {
    let legacy = storage::retrieve_json::<EventData>(store, LEGACY_DATA_LAYER_KEY)?;
    Ok(legacy.map(|legacy| from_legacy(legacy, now)))
}

pub fn discard_legacy(store: &dyn PersistentStore) -> Result<(), StoreError> {
    store.delete(LEGACY_DATA_LAYER_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{save_json, MemoryStore};
    use serde_json::json;

    #[test]
    fn legacy_blob_is_kept_until_discarded() {
        let store = MemoryStore::new();
        let legacy = json!({"user": "abc", "tier": 2}).as_object().cloned().unwrap();
        save_json(&store, LEGACY_DATA_LAYER_KEY, &legacy).unwrap();

        let items = migrate(&store, Utc::now()).unwrap().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.get("tier").unwrap().expiry, Expiry::Forever);
        // reading does not consume the blob
        assert!(migrate(&store, Utc::now()).unwrap().is_some());

        discard_legacy(&store).unwrap();
        assert!(migrate(&store, Utc::now()).unwrap().is_none());
    }
}
