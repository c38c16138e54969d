use anyhow::{Context, Result};
use authguard::auth::TokenValidationStrategy;
use authguard::config::{self, AuthGuardConfig};
use chrono::Utc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authguard=info".into()),
        )
        .init();

    info!("Authguard starting...");

    let config_path =
        std::env::var("AUTHGUARD_CONFIG").unwrap_or_else(|_| "authguard.toml".to_string());

    let mut config = if std::path::Path::new(&config_path).exists() {
        config::load_config(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        AuthGuardConfig::default()
    };
    config.apply_env_overrides();

    info!(
        backend = ?config.store.backend,
        store_path = %config.store.path.display(),
        credential_key = %config.auth.credential_key,
        base_url = %config.transport.base_url,
        "Configuration loaded"
    );

    let encryption_key = config.encryption_key()?;
    let store = config::open_store(&config, &encryption_key)
        .context("Failed to initialize credential store")?;
    let pipeline = config::build_pipeline(&config, store.clone())?;
    let key = pipeline.coordinator().credential_key().to_string();

    if std::env::var("AUTHGUARD_LOGOUT").is_ok_and(|v| v == "1") {
        store.delete(&key).await?;
        info!(key = %key, "Stored credential removed");
        return Ok(());
    }

    let validation = config::expiry_validation(&config);
    match store.load_credential(&key).await? {
        Some(credential) if !validation.is_valid(&credential, Utc::now()) => info!(
            key = %key,
            expiry = %credential.expiry,
            refreshable = credential.has_refresh_secret(),
            leeway_seconds = config.auth.expiry_leeway_seconds,
            "Stored credential expired or inside expiry leeway"
        ),
        Some(credential) => info!(key = %key, expiry = %credential.expiry, "Stored credential valid"),
        None => info!(key = %key, "No stored credential"),
    }

    Ok(())
}
