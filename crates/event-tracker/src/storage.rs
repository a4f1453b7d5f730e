// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key-value blob storage backing the data layer, consent preferences, the
//! hosted data layer cache and the dispatch queue.
//!
//! Every record is a JSON document stored under a fixed key. Writes to disk go
//! through a temporary file followed by a rename, so a crash mid-write leaves
//! the previous record in place instead of a truncated one.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::util;

/// Key of the persisted data layer item set.
pub const DATA_LAYER_KEY: &str = "data_layer";
/// Key of the pre-expiry flat data layer map.
pub const LEGACY_DATA_LAYER_KEY: &str = "legacy_data_layer";
pub const CONSENT_KEY: &str = "consent_preferences";
pub const HOSTED_CACHE_KEY: &str = "hosted_data_layer";
pub const QUEUE_KEY: &str = "dispatch_queue";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait PersistentStore: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn PersistentStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.save(key, &bytes)
}

pub fn retrieve_json<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.retrieve(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// One file per key under a per-instance directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (or creates) `root/instance`.
    pub fn open(root: &Path, instance: &str) -> Result<Self, StoreError> {
        let dir = root.join(instance);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl PersistentStore for FileStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        util::lock(&self.records).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(util::lock(&self.records).get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        util::lock(&self.records).remove(key);
        Ok(())
    }
}
