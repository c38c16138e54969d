//! Builds the store and pipeline from configuration.

use super::{AuthGuardConfig, BackendKind};
use crate::auth::{ExpiryValidation, PublicPrefixPolicy};
use crate::pipeline::{AuthPipeline, ClearStoredCredential, ReqwestTransport};
use crate::refresh::HttpRefreshClient;
use crate::store::{MemoryBackend, SecretBackend, SecureCredentialStore, SqliteBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Opens the configured backend and wraps it in a secure store.
pub fn open_store(config: &AuthGuardConfig, encryption_key: &str) -> Result<Arc<SecureCredentialStore>> {
    let backend: Arc<dyn SecretBackend> = match config.store.backend {
        BackendKind::Sqlite => {
            info!(path = %config.store.path.display(), "Opening SQLite secret store");
            Arc::new(
                SqliteBackend::open(&config.store.path).context("Failed to open secret store")?,
            )
        }
        BackendKind::Memory => {
            info!("Using in-memory secret store");
            Arc::new(MemoryBackend::new())
        }
    };

    let store = SecureCredentialStore::new(backend, encryption_key)?
        .with_max_write_attempts(config.store.max_write_attempts);
    Ok(Arc::new(store))
}

/// Expiry check the pipeline applies before attaching a stored credential.
pub fn expiry_validation(config: &AuthGuardConfig) -> ExpiryValidation {
    ExpiryValidation::with_leeway_seconds(config.auth.expiry_leeway_seconds)
}

/// Wires transport, refresh client, policies, and teardown around `store`.
pub fn build_pipeline(
    config: &AuthGuardConfig,
    store: Arc<SecureCredentialStore>,
) -> Result<AuthPipeline> {
    let transport = ReqwestTransport::new(
        config.transport.base_url.clone(),
        Duration::from_secs(config.transport.timeout_seconds),
    )?;

    let refresh = HttpRefreshClient::new(
        config.refresh.token_url.clone(),
        Duration::from_secs(config.refresh.timeout_seconds),
    )?
    .with_client_credentials(
        config.refresh.client_id.clone(),
        config.refresh.client_secret.clone(),
    )
    .with_default_lifetime(config.refresh.default_lifetime_seconds);

    let key = config.auth.credential_key.clone();
    let teardown = ClearStoredCredential::new(Arc::clone(&store), key.clone());

    Ok(
        AuthPipeline::builder(Arc::new(transport), store, Arc::new(refresh), Arc::new(teardown))
            .credential_key(key)
            .route_policy(Arc::new(PublicPrefixPolicy::new(
                config.auth.public_prefixes.iter().cloned(),
            )))
            .validation(Arc::new(expiry_validation(config)))
            .build(),
    )
}
