//! Credential value type and at-rest encryption.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecureCredentialStore              │
//! │  - save / load / delete                  │
//! │  - per-key critical sections             │
//! │  - legacy plaintext migration            │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!       (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per record               │
//! │  - Storage key bound as AAD              │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretBackend                      │
//! │  - SQLite or in-memory                   │
//! │  - Reports duplicate-key conflicts       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Secrets are encrypted at rest with AES-256-GCM
//! - Master key must be 32 bytes (256 bits), held in memory only
//! - Authenticated encryption (tampering detected)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod encryption;

pub use encryption::{is_sealed, open, seal, validate_key, OpenError};

/// Largest expiry difference still considered the same credential.
const EXPIRY_SKEW_TOLERANCE_MS: i64 = 1_000;

/// Credentials attached to outbound requests.
///
/// Immutable once created: a refresh produces a new value rather than
/// mutating the old one.
///
/// Equality tolerates up to one second of skew on `expiry`, since timestamps
/// lose precision when they round-trip through serialization. The relation is
/// therefore not transitive and the type does not implement `Eq`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    /// Secret sent as the bearer token
    pub access_secret: String,

    /// When `access_secret` stops being accepted (UTC)
    pub expiry: DateTime<Utc>,

    /// Secret exchanged for a new credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_secret: Option<String>,
}

impl Credential {
    pub fn new(
        access_secret: impl Into<String>,
        expiry: DateTime<Utc>,
        refresh_secret: Option<String>,
    ) -> Self {
        Self {
            access_secret: access_secret.into(),
            expiry,
            refresh_secret,
        }
    }

    /// True once `now` has reached `expiry`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// True if the credential expires within `leeway` from now (or already has).
    pub fn expires_within(&self, leeway: Duration) -> bool {
        self.is_expired_at(Utc::now() + leeway)
    }

    pub fn has_refresh_secret(&self) -> bool {
        self.refresh_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        let skew = (self.expiry - other.expiry).num_milliseconds().abs();
        self.access_secret == other.access_secret
            && self.refresh_secret == other.refresh_secret
            && skew <= EXPIRY_SKEW_TOLERANCE_MS
    }
}
