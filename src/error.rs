//! Error taxonomy for the store, refresh, and request pipeline layers.
//!
//! Retryable and transient failures are kept apart from the ones that must end
//! the session, so callers above this crate only ever see three shapes: a
//! response, a transient error, or [`PipelineError::SessionTeardownRequired`].

use thiserror::Error;

/// Secure store errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Storage keys must be non-empty
    #[error("Storage key must not be empty")]
    InvalidKey,

    /// Duplicate-key conflicts persisted past the retry ceiling
    #[error("Write conflict on '{key}' after {attempts} attempts")]
    WriteConflict { key: String, attempts: u32 },

    /// Backend refused the write, or the written value could not be read back
    #[error("Store write failed: {0}")]
    Failure(String),

    /// Backend could not be read
    #[error("Store unreadable: {0}")]
    Unreadable(String),

    /// Record exists but is not a valid secret for this key
    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    /// Encrypting the payload failed
    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Classification of a failed refresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailureKind {
    /// Upstream rejected the refresh secret (or there was none to send)
    Unauthorized,
    /// Transient connectivity problem; the session survives
    Network,
    /// Upstream answered with something that is not a credential
    Malformed,
    /// Anything else, including failure to persist the new credential
    Unknown,
}

impl RefreshFailureKind {
    /// Only network failures leave the session intact.
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshFailureKind::Network)
    }
}

impl std::fmt::Display for RefreshFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshFailureKind::Unauthorized => write!(f, "unauthorized"),
            RefreshFailureKind::Network => write!(f, "network"),
            RefreshFailureKind::Malformed => write!(f, "malformed"),
            RefreshFailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Terminal outcome of one coordinated refresh, shared by every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Refresh failed ({kind}): {message}")]
pub struct RefreshFailed {
    pub kind: RefreshFailureKind,
    pub message: String,
    /// Refresh window that produced this failure
    pub window: u64,
}

/// Errors returned by the upstream refresh endpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshApiError {
    #[error("Refresh request failed to reach upstream: {0}")]
    Network(String),

    #[error("Refresh rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed refresh response: {0}")]
    Malformed(String),

    #[error("Refresh failed: {0}")]
    Other(String),
}

/// Errors returned by a transport sender.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Server answered with a non-success status
    #[error("Request failed with status {status}")]
    Status { status: u16, body: Vec<u8> },

    /// Connection, DNS, or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors surfaced by the authenticated pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Refresh failed for a non-network reason; teardown has been attempted
    #[error("Session teardown required: {0}")]
    SessionTeardownRequired(RefreshFailed),
}

impl PipelineError {
    pub fn is_teardown(&self) -> bool {
        matches!(self, PipelineError::SessionTeardownRequired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_transient() {
        assert!(RefreshFailureKind::Network.is_transient());
        assert!(!RefreshFailureKind::Unauthorized.is_transient());
        assert!(!RefreshFailureKind::Malformed.is_transient());
        assert!(!RefreshFailureKind::Unknown.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = StoreError::WriteConflict {
            key: "session".to_string(),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "Write conflict on 'session' after 3 attempts");

        let failed = RefreshFailed {
            kind: RefreshFailureKind::Network,
            message: "connection reset".to_string(),
            window: 1,
        };
        assert_eq!(failed.to_string(), "Refresh failed (network): connection reset");
    }
}
