//! Authenticated request pipeline.
//!
//! Stages, each wrapping the next:
//! 1. Route gate: requests that need no auth go straight to the transport
//! 2. Refresh-and-retry: on an unauthorized response, refresh once and retry once
//! 3. Attach: add the stored credential as a bearer header if still valid
//! 4. Transport: the raw sender
//!
//! # Usage
//!
//! ```no_run
//! use authguard::pipeline::{AuthPipeline, ClearStoredCredential, OutboundRequest, ReqwestTransport};
//! use authguard::refresh::HttpRefreshClient;
//! use authguard::store::{MemoryBackend, SecureCredentialStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let key = std::env::var("AUTHGUARD_ENCRYPTION_KEY")?;
//! let store = Arc::new(SecureCredentialStore::new(Arc::new(MemoryBackend::new()), &key)?);
//! let transport = Arc::new(ReqwestTransport::new("https://api.example.com", Duration::from_secs(30))?);
//! let refresh = Arc::new(HttpRefreshClient::new("https://auth.example.com/token", Duration::from_secs(30))?);
//! let teardown = Arc::new(ClearStoredCredential::new(store.clone(), "session"));
//!
//! let pipeline = AuthPipeline::builder(transport, store, refresh, teardown)
//!     .credential_key("session")
//!     .build();
//!
//! let response = pipeline.send(OutboundRequest::get("/api/profile")).await?;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```

mod classify;
mod request;
mod stages;
mod teardown;
mod transport;

pub use classify::{Classification, DefaultClassifier, FailureClassifier};
pub use request::{OutboundRequest, TransportResponse};
pub use stages::{AttachCredential, RefreshRetry, RequestPhase};
pub use teardown::{ClearStoredCredential, SessionTeardown};
pub use transport::ReqwestTransport;

use crate::auth::{ExpiryValidation, PublicPrefixPolicy, RouteAuthenticationPolicy, TokenValidationStrategy};
use crate::error::{PipelineError, TransportError};
use crate::refresh::{RefreshApi, RefreshCoordinator};
use crate::store::SecureCredentialStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Storage key used for the session credential unless configured otherwise.
pub const DEFAULT_CREDENTIAL_KEY: &str = "session";

/// Executes a request. Implementations only need to report failures
/// faithfully; classification happens in the pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        (**self).send(request).await
    }
}

type AuthenticatedStack = RefreshRetry<AttachCredential<Arc<dyn Transport>>>;

/// Entry point: the route gate in front of the authenticated stages.
pub struct AuthPipeline {
    policy: Arc<dyn RouteAuthenticationPolicy>,
    bypass: Arc<dyn Transport>,
    authenticated: AuthenticatedStack,
}

impl AuthPipeline {
    pub fn builder(
        transport: Arc<dyn Transport>,
        store: Arc<SecureCredentialStore>,
        refresh_api: Arc<dyn RefreshApi>,
        teardown: Arc<dyn SessionTeardown>,
    ) -> AuthPipelineBuilder {
        AuthPipelineBuilder {
            transport,
            store,
            refresh_api,
            teardown,
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            policy: Arc::new(PublicPrefixPolicy::default()),
            validation: Arc::new(ExpiryValidation::default()),
            classifier: Arc::new(DefaultClassifier),
        }
    }

    /// Sends `request`, authenticating it if the route policy requires.
    ///
    /// # Errors
    /// * `Transport` - Transport failure, or unauthorized with the session kept
    /// * `SessionTeardownRequired` - Refresh failed for good; teardown attempted
    pub async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, PipelineError> {
        if !self.policy.requires_auth(&request) {
            debug!(request_id = %request.id(), path = %request.path(), "Public route, skipping auth stages");
            return self.bypass.send(request).await.map_err(PipelineError::from);
        }
        self.authenticated.send(request).await
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        self.authenticated.coordinator()
    }
}

pub struct AuthPipelineBuilder {
    transport: Arc<dyn Transport>,
    store: Arc<SecureCredentialStore>,
    refresh_api: Arc<dyn RefreshApi>,
    teardown: Arc<dyn SessionTeardown>,
    credential_key: String,
    policy: Arc<dyn RouteAuthenticationPolicy>,
    validation: Arc<dyn TokenValidationStrategy>,
    classifier: Arc<dyn FailureClassifier>,
}

impl AuthPipelineBuilder {
    pub fn credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = key.into();
        self
    }

    pub fn route_policy(mut self, policy: Arc<dyn RouteAuthenticationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn validation(mut self, validation: Arc<dyn TokenValidationStrategy>) -> Self {
        self.validation = validation;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn build(self) -> AuthPipeline {
        let coordinator = RefreshCoordinator::new(
            self.refresh_api,
            Arc::clone(&self.store),
            self.credential_key.clone(),
            Arc::clone(&self.classifier),
        );
        let attach = AttachCredential::new(
            Arc::clone(&self.transport),
            self.store,
            self.credential_key,
            self.validation,
        );

        AuthPipeline {
            policy: self.policy,
            bypass: self.transport,
            authenticated: RefreshRetry::new(attach, coordinator, self.classifier, self.teardown),
        }
    }
}
