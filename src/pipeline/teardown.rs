use crate::store::SecureCredentialStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Ends the session after an unrecoverable authentication failure.
///
/// Called before [`crate::PipelineError::SessionTeardownRequired`] is
/// returned. A failure here is logged; the terminal error is raised anyway.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn perform_global_logout(&self) -> Result<()>;
}

/// Teardown that forgets the stored credential.
pub struct ClearStoredCredential {
    store: Arc<SecureCredentialStore>,
    credential_key: String,
}

impl ClearStoredCredential {
    pub fn new(store: Arc<SecureCredentialStore>, credential_key: impl Into<String>) -> Self {
        Self {
            store,
            credential_key: credential_key.into(),
        }
    }
}

#[async_trait]
impl SessionTeardown for ClearStoredCredential {
    async fn perform_global_logout(&self) -> Result<()> {
        self.store
            .delete(&self.credential_key)
            .await
            .context("Failed to clear stored credential")?;
        info!(key = %self.credential_key, "Stored credential cleared");
        Ok(())
    }
}
