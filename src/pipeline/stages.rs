//! Interceptor stages, outermost first:
//! route gate → refresh-and-retry → credential attach → transport.

use super::classify::{Classification, FailureClassifier};
use super::teardown::SessionTeardown;
use super::{OutboundRequest, Transport, TransportResponse};
use crate::auth::{attach_bearer, TokenValidationStrategy};
use crate::error::{PipelineError, RefreshFailed, TransportError};
use crate::refresh::RefreshCoordinator;
use crate::store::SecureCredentialStore;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Where a request is in the auth state machine (recorded in traces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Unauthenticated,
    Attached,
    Sent,
    Success,
    Unauthorized,
    RefreshSucceeded,
    Retried,
    NetworkError,
    TeardownTriggered,
    /// Unauthorized again after the single retry
    Terminal,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestPhase::Unauthenticated => "unauthenticated",
            RequestPhase::Attached => "attached",
            RequestPhase::Sent => "sent",
            RequestPhase::Success => "success",
            RequestPhase::Unauthorized => "unauthorized",
            RequestPhase::RefreshSucceeded => "refresh_succeeded",
            RequestPhase::Retried => "retried",
            RequestPhase::NetworkError => "network_error",
            RequestPhase::TeardownTriggered => "teardown_triggered",
            RequestPhase::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Attaches the stored credential when it is still valid.
///
/// Requests that already carry an `Authorization` header are left alone. A
/// missing, expired, or unreadable credential never blocks the request: it
/// goes out unauthenticated and the server decides.
pub struct AttachCredential<T> {
    inner: T,
    store: Arc<SecureCredentialStore>,
    credential_key: String,
    validation: Arc<dyn TokenValidationStrategy>,
}

impl<T> AttachCredential<T> {
    pub fn new(
        inner: T,
        store: Arc<SecureCredentialStore>,
        credential_key: impl Into<String>,
        validation: Arc<dyn TokenValidationStrategy>,
    ) -> Self {
        Self {
            inner,
            store,
            credential_key: credential_key.into(),
            validation,
        }
    }

    async fn attach(&self, request: &mut OutboundRequest) -> RequestPhase {
        let id = request.id();
        match self.store.load_credential(&self.credential_key).await {
            Ok(Some(credential)) if self.validation.is_valid(&credential, Utc::now()) => {
                match attach_bearer(request.headers_mut(), &credential.access_secret) {
                    Ok(()) => RequestPhase::Attached,
                    Err(e) => {
                        warn!(request_id = %id, error = %e, "Stored credential is not a valid header value");
                        RequestPhase::Unauthenticated
                    }
                }
            }
            Ok(Some(_)) => {
                debug!(request_id = %id, "Stored credential expired, sending unauthenticated");
                RequestPhase::Unauthenticated
            }
            Ok(None) => {
                debug!(request_id = %id, "No stored credential, sending unauthenticated");
                RequestPhase::Unauthenticated
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to load credential, sending unauthenticated");
                RequestPhase::Unauthenticated
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for AttachCredential<T> {
    async fn send(&self, mut request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let phase = if request.headers().contains_key(AUTHORIZATION) {
            RequestPhase::Attached
        } else {
            self.attach(&mut request).await
        };

        debug!(request_id = %request.id(), %phase, "Credential stage complete");
        self.inner.send(request).await
    }
}

/// Refreshes once on an unauthorized response and retries the request once.
///
/// A 401 that arrives after a refresh window closed reuses that window's
/// outcome instead of refreshing again. Network refresh failures return the
/// original unauthorized error and keep the session. Every other refresh
/// failure tears the session down (once per failed refresh window) and
/// yields [`PipelineError::SessionTeardownRequired`]; no request in the
/// window returns before that teardown has finished.
pub struct RefreshRetry<T> {
    inner: T,
    coordinator: RefreshCoordinator,
    classifier: Arc<dyn FailureClassifier>,
    teardown: Arc<dyn SessionTeardown>,
    /// Last refresh window whose teardown completed
    torn_down: Mutex<u64>,
}

impl<T: Transport> RefreshRetry<T> {
    pub fn new(
        inner: T,
        coordinator: RefreshCoordinator,
        classifier: Arc<dyn FailureClassifier>,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Self {
        Self {
            inner,
            coordinator,
            classifier,
            teardown,
            torn_down: Mutex::new(0),
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, PipelineError> {
        let id = request.id();
        let retry = request.clone();
        let seen_window = self.coordinator.last_completed_window();

        let first = self.inner.send(request).await;
        if self.classifier.classify_transport(&first) != Classification::Unauthorized {
            debug!(request_id = %id, phase = %RequestPhase::Sent, "Request completed without refresh");
            return first.map_err(PipelineError::from);
        }
        let original = into_unauthorized_error(first);
        debug!(request_id = %id, phase = %RequestPhase::Unauthorized, "Unauthorized, refreshing credential");

        let credential = match self.coordinator.refresh_since(seen_window).await {
            Ok(credential) => credential,
            Err(failed) if failed.kind.is_transient() => {
                warn!(
                    request_id = %id,
                    phase = %RequestPhase::NetworkError,
                    window = failed.window,
                    error = %failed,
                    "Refresh hit a network error, keeping session"
                );
                return Err(PipelineError::Transport(original));
            }
            Err(failed) => {
                self.teardown_once(&failed).await;
                return Err(PipelineError::SessionTeardownRequired(failed));
            }
        };
        debug!(request_id = %id, phase = %RequestPhase::RefreshSucceeded, "Retrying with refreshed credential");

        let mut retry = retry;
        if let Err(e) = attach_bearer(retry.headers_mut(), &credential.access_secret) {
            warn!(request_id = %id, error = %e, "Refreshed credential is not a valid header value");
            return Err(PipelineError::Transport(original));
        }

        let second = self.inner.send(retry).await;
        if self.classifier.classify_transport(&second) == Classification::Unauthorized {
            warn!(request_id = %id, phase = %RequestPhase::Terminal, "Unauthorized after refresh, giving up");
            return Err(PipelineError::Transport(into_unauthorized_error(second)));
        }

        let phase = if second.is_ok() {
            RequestPhase::Success
        } else {
            RequestPhase::Retried
        };
        debug!(request_id = %id, %phase, "Retry complete");
        second.map_err(PipelineError::from)
    }

    async fn teardown_once(&self, failed: &RefreshFailed) {
        // Held across the teardown so later requests wait for it to finish
        let mut torn_down = self.torn_down.lock().await;
        if *torn_down >= failed.window {
            debug!(window = failed.window, "Session already torn down for this refresh window");
            return;
        }

        error!(
            phase = %RequestPhase::TeardownTriggered,
            window = failed.window,
            kind = %failed.kind,
            error = %failed,
            "Unrecoverable refresh failure, tearing down session"
        );
        if let Err(e) = self.teardown.perform_global_logout().await {
            error!(error = %e, "Session teardown failed");
        }
        *torn_down = failed.window;
    }
}

/// Unauthorized outcomes surface as a `Status` error even when the transport
/// returned them as a response.
fn into_unauthorized_error(outcome: Result<TransportResponse, TransportError>) -> TransportError {
    match outcome {
        Ok(response) => TransportError::Status {
            status: response.status.as_u16(),
            body: response.body,
        },
        Err(e) => e,
    }
}
