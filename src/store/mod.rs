//! Encrypted secret store with conflict recovery and legacy migration.
//!
//! Every read/seal/write/verify sequence for a key runs inside that key's
//! critical section. Writes go through a small state machine:
//!
//! ```text
//! Fresh ──add──▶ Updated ──verify──▶ Ok
//!   │ duplicate     ▲
//!   ▼               │
//! Conflict ──update─┘
//!   │ conflict again
//!   ▼
//! Fresh (next attempt) … GaveUp once the attempt ceiling is reached
//! ```

mod backend;
mod locks;
mod sqlite;


pub use backend::{MemoryBackend, SecretBackend, WriteStatus};
pub use sqlite::SqliteBackend;

use crate::credentials::{encryption, Credential, OpenError};
use crate::error::StoreError;
use anyhow::{Context, Result};
use locks::KeyLocks;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of write attempts before a conflict is surfaced.
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

/// Hard upper bound on configurable write attempts.
pub const MAX_WRITE_ATTEMPTS_CEILING: u32 = 5;

/// Position in the save state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Fresh,
    Conflict,
    Updated,
    GaveUp,
}

/// What happened to a legacy plaintext record during a load.
#[derive(Debug, Clone, PartialEq)]
pub enum Migration {
    /// Record was already sealed
    NotNeeded,
    /// Plaintext was re-sealed in place
    Migrated,
    /// Re-sealing failed; the plaintext value was still returned
    Failed(StoreError),
}

/// Decrypted secret plus the migration status of its record.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSecret {
    pub data: Vec<u8>,
    pub migration: Migration,
}

/// Secure store for named secrets.
///
/// # Security
/// - Values are sealed with AES-256-GCM before they reach the backend
/// - The key name is bound to its record, records cannot be swapped
/// - A write is only reported successful once it reads back intact
pub struct SecureCredentialStore {
    backend: Arc<dyn SecretBackend>,
    encryption_key: Vec<u8>,
    locks: KeyLocks,
    max_write_attempts: u32,
}

impl SecureCredentialStore {
    /// Creates a store over `backend`.
    ///
    /// # Arguments
    /// * `backend` - Raw secret storage
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new(backend: Arc<dyn SecretBackend>, encryption_key: &str) -> Result<Self> {
        let key_bytes =
            encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        Ok(Self {
            backend,
            encryption_key: key_bytes,
            locks: KeyLocks::new(),
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        })
    }

    /// Sets the write attempt ceiling, clamped to `1..=MAX_WRITE_ATTEMPTS_CEILING`.
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.clamp(1, MAX_WRITE_ATTEMPTS_CEILING);
        self
    }

    pub fn max_write_attempts(&self) -> u32 {
        self.max_write_attempts
    }

    /// Seals and durably writes `data` under `key` (last write wins).
    ///
    /// # Errors
    /// * `WriteConflict` - Duplicate-key conflicts outlasted the attempt ceiling
    /// * `Failure` - Backend failed, or the written value did not read back
    pub async fn save(&self, data: &[u8], key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        self.save_locked(data, key).await
    }

    /// Loads and decrypts the secret under `key`; `None` when absent.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.load_detailed(key).await?.map(|loaded| loaded.data))
    }

    /// Like [`load`](Self::load), also reporting legacy migration status.
    ///
    /// A record that is not sealed is treated as legacy plaintext: it is
    /// re-sealed under the same key and returned. A failed re-seal is
    /// reported in [`LoadedSecret::migration`] but does not fail the load.
    ///
    /// # Errors
    /// * `Unreadable` - Backend read failed
    /// * `DecodingFailed` - Record is sealed but does not open with this key
    pub async fn load_detailed(&self, key: &str) -> Result<Option<LoadedSecret>, StoreError> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;

        let raw = match self
            .backend
            .read(key)
            .await
            .map_err(|e| StoreError::Unreadable(format!("{:#}", e)))?
        {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match encryption::open(&raw, key.as_bytes(), &self.encryption_key) {
            Ok(data) => Ok(Some(LoadedSecret {
                data,
                migration: Migration::NotNeeded,
            })),
            Err(OpenError::NotCiphertext) => {
                let migration = match self.save_locked(&raw, key).await {
                    Ok(()) => {
                        info!(key = %key, "Migrated legacy plaintext secret to encrypted storage");
                        Migration::Migrated
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Legacy secret migration failed, returning plaintext value");
                        Migration::Failed(e)
                    }
                };
                Ok(Some(LoadedSecret {
                    data: raw,
                    migration,
                }))
            }
            Err(OpenError::Rejected(reason)) => {
                warn!(key = %key, "Stored secret failed to decrypt");
                Err(StoreError::DecodingFailed(reason))
            }
        }
    }

    /// Removes `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;

        let removed = self
            .backend
            .remove(key)
            .await
            .map_err(|e| StoreError::Failure(format!("{:#}", e)))?;
        debug!(key = %key, removed, "Secret deleted");
        Ok(())
    }

    /// Saves `credential` as JSON under `key`.
    pub async fn save_credential(&self, credential: &Credential, key: &str) -> Result<(), StoreError> {
        let json = serde_json::to_vec(credential)
            .map_err(|e| StoreError::Encryption(format!("Failed to serialize credential: {}", e)))?;
        self.save(&json, key).await
    }

    /// Loads the credential under `key`; `None` when absent.
    pub async fn load_credential(&self, key: &str) -> Result<Option<Credential>, StoreError> {
        match self.load(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DecodingFailed(format!("Stored credential is malformed: {}", e))),
            None => Ok(None),
        }
    }

    /// Caller must hold the lock for `key`.
    async fn save_locked(&self, data: &[u8], key: &str) -> Result<(), StoreError> {
        let sealed = encryption::seal(data, key.as_bytes(), &self.encryption_key)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;

        let mut state = WriteState::Fresh;
        let mut attempts = 0u32;

        loop {
            state = match state {
                WriteState::Fresh => {
                    attempts += 1;
                    match self.backend.add(key, &sealed).await.map_err(write_failure)? {
                        WriteStatus::Written => WriteState::Updated,
                        WriteStatus::Duplicate | WriteStatus::Missing => WriteState::Conflict,
                    }
                }
                WriteState::Conflict => {
                    match self.backend.update(key, &sealed).await.map_err(write_failure)? {
                        WriteStatus::Written => WriteState::Updated,
                        status => {
                            debug!(key = %key, attempt = attempts, ?status, "Write conflict on update");
                            if attempts >= self.max_write_attempts {
                                WriteState::GaveUp
                            } else {
                                WriteState::Fresh
                            }
                        }
                    }
                }
                WriteState::Updated => return self.verify(key, &sealed).await,
                WriteState::GaveUp => {
                    warn!(key = %key, attempts, "Giving up on conflicting secret write");
                    return Err(StoreError::WriteConflict {
                        key: key.to_string(),
                        attempts,
                    });
                }
            };
        }
    }

    /// Reads `key` back and checks it holds exactly `sealed`.
    async fn verify(&self, key: &str, sealed: &[u8]) -> Result<(), StoreError> {
        match self.backend.read(key).await.map_err(write_failure)? {
            Some(stored) if stored == sealed => {
                debug!(key = %key, "Secret saved");
                Ok(())
            }
            _ => Err(StoreError::Failure(format!(
                "Write to '{}' reported success but did not read back",
                key
            ))),
        }
    }
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

fn write_failure(err: anyhow::Error) -> StoreError {
    StoreError::Failure(format!("{:#}", err))
}
