// Credential model and sealing
pub mod credentials;

// Encrypted secret store
pub mod store;

// Bearer tokens and auth policies
pub mod auth;

// Single-flight credential refresh
pub mod refresh;

// Authenticated request pipeline
pub mod pipeline;

// Configuration loading and wiring
pub mod config;

// Error types
pub mod error;

pub use credentials::Credential;
pub use error::{PipelineError, RefreshFailed, RefreshFailureKind, StoreError, TransportError};
pub use pipeline::{AuthPipeline, OutboundRequest, TransportResponse};
pub use refresh::RefreshCoordinator;
pub use store::SecureCredentialStore;
