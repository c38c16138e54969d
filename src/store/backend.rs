//! Raw secret backends.
//!
//! A backend is the platform secure store underneath [`super::SecureCredentialStore`]:
//! it keeps opaque bytes per key and reports key-scoped conflicts instead of
//! silently overwriting.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

/// Outcome of a backend write that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Value stored
    Written,
    /// `add` found an existing item under the key
    Duplicate,
    /// `update` found no item under the key
    Missing,
}

/// Key/value facility with keychain-style conflict semantics.
///
/// Hard failures are returned as `Err`; conflicts are reported through
/// [`WriteStatus`] so callers can decide how to recover.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Inserts a new item. Returns [`WriteStatus::Duplicate`] if the key exists.
    async fn add(&self, key: &str, value: &[u8]) -> Result<WriteStatus>;

    /// Replaces an existing item. Returns [`WriteStatus::Missing`] if the key is absent.
    async fn update(&self, key: &str, value: &[u8]) -> Result<WriteStatus>;

    /// Reads the raw bytes for `key`, `None` when absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key`. Returns whether an item was removed.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory backend. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes raw bytes without any conflict handling.
    ///
    /// Used to seed records written by older versions (plaintext).
    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.items.insert(key.to_string(), value.to_vec());
    }

    /// Returns the raw bytes as stored.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.items.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn add(&self, key: &str, value: &[u8]) -> Result<WriteStatus> {
        match self.items.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(WriteStatus::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(value.to_vec());
                Ok(WriteStatus::Written)
            }
        }
    }

    async fn update(&self, key: &str, value: &[u8]) -> Result<WriteStatus> {
        match self.items.get_mut(key) {
            Some(mut existing) => {
                *existing = value.to_vec();
                Ok(WriteStatus::Written)
            }
            None => Ok(WriteStatus::Missing),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.raw(key))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.items.remove(key).is_some())
    }
}
