//! Mapping of transport and refresh failures onto the pipeline's decisions.
//!
//! Which signals count as "unauthorized" versus "network" depends on the
//! server and transport in use, so the mapping is injectable.

use super::TransportResponse;
use crate::error::{RefreshApiError, RefreshFailureKind, TransportError};
use reqwest::StatusCode;

/// How a single send attempt turned out, as far as auth is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Authentication-required signal; triggers refresh-and-retry
    Unauthorized,
    /// Transient connectivity failure
    Network,
    /// Anything else, passed through untouched
    Other,
}

pub trait FailureClassifier: Send + Sync {
    fn classify_transport(
        &self,
        outcome: &Result<TransportResponse, TransportError>,
    ) -> Classification;

    fn classify_refresh(&self, error: &RefreshApiError) -> RefreshFailureKind;
}

/// Status-code based classification.
///
/// Only `401 Unauthorized` is the authentication-required signal; `403` and
/// other client errors pass through. Refresh rejections with 400/401/403
/// (e.g. `invalid_grant`) mean the refresh secret is dead; 429 and 5xx are
/// treated like connectivity failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify_transport(
        &self,
        outcome: &Result<TransportResponse, TransportError>,
    ) -> Classification {
        match outcome {
            Ok(response) if response.status == StatusCode::UNAUTHORIZED => {
                Classification::Unauthorized
            }
            Ok(_) => Classification::Other,
            Err(TransportError::Status { status, .. })
                if *status == StatusCode::UNAUTHORIZED.as_u16() =>
            {
                Classification::Unauthorized
            }
            Err(TransportError::Network(_)) => Classification::Network,
            Err(_) => Classification::Other,
        }
    }

    fn classify_refresh(&self, error: &RefreshApiError) -> RefreshFailureKind {
        match error {
            RefreshApiError::Network(_) => RefreshFailureKind::Network,
            RefreshApiError::Rejected { status, .. } if matches!(*status, 400 | 401 | 403) => {
                RefreshFailureKind::Unauthorized
            }
            // Upstream outage or throttling: the refresh secret may still be good
            RefreshApiError::Rejected { status, .. } if *status == 429 || *status >= 500 => {
                RefreshFailureKind::Network
            }
            RefreshApiError::Rejected { .. } => RefreshFailureKind::Unknown,
            RefreshApiError::Malformed(_) => RefreshFailureKind::Malformed,
            RefreshApiError::Other(_) => RefreshFailureKind::Unknown,
        }
    }
}
