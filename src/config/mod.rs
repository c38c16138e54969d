mod wiring;

pub use wiring::{build_pipeline, expiry_validation, open_store};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Complete authguard configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthGuardConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Which secret backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "memory" => Ok(BackendKind::Memory),
            other => Err(anyhow::anyhow!("Unknown store backend '{}'", other)),
        }
    }
}

/// Secure store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Environment variable holding the base64 master key
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
    /// Attempts before a duplicate-key conflict is surfaced
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("authguard.db")
}

fn default_encryption_key_env() -> String {
    "AUTHGUARD_ENCRYPTION_KEY".to_string()
}

fn default_max_write_attempts() -> u32 {
    crate::store::DEFAULT_MAX_WRITE_ATTEMPTS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            encryption_key_env: default_encryption_key_env(),
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

/// Credential attachment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Storage key of the session credential
    #[serde(default = "default_credential_key")]
    pub credential_key: String,
    /// Path prefixes sent without credentials
    #[serde(default = "default_public_prefixes")]
    pub public_prefixes: Vec<String>,
    /// Treat credentials expiring within this window as already expired
    #[serde(default)]
    pub expiry_leeway_seconds: i64,
}

fn default_credential_key() -> String {
    crate::pipeline::DEFAULT_CREDENTIAL_KEY.to_string()
}

fn default_public_prefixes() -> Vec<String> {
    vec!["/public".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_key: default_credential_key(),
            public_prefixes: default_public_prefixes(),
            expiry_leeway_seconds: 0,
        }
    }
}

/// Upstream refresh endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Lifetime assumed when the endpoint omits `expires_in`
    #[serde(default = "default_lifetime_seconds")]
    pub default_lifetime_seconds: i64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_token_url() -> String {
    "http://localhost:3000/oauth/token".to_string()
}

fn default_lifetime_seconds() -> i64 {
    3600
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: None,
            client_secret: None,
            default_lifetime_seconds: default_lifetime_seconds(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Outbound transport configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl AuthGuardConfig {
    /// Applies `AUTHGUARD_*` environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`; unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AUTHGUARD_STORE_BACKEND") {
            if let Ok(kind) = v.parse() {
                self.store.backend = kind;
            }
        }
        if let Some(v) = lookup("AUTHGUARD_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AUTHGUARD_MAX_WRITE_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.store.max_write_attempts = n;
            }
        }
        if let Some(v) = lookup("AUTHGUARD_CREDENTIAL_KEY") {
            if !v.is_empty() {
                self.auth.credential_key = v;
            }
        }
        if let Some(v) = lookup("AUTHGUARD_PUBLIC_PREFIXES") {
            self.auth.public_prefixes = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("AUTHGUARD_EXPIRY_LEEWAY_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.auth.expiry_leeway_seconds = n;
            }
        }
        if let Some(v) = lookup("AUTHGUARD_TOKEN_URL") {
            self.refresh.token_url = v;
        }
        if let Some(v) = lookup("AUTHGUARD_CLIENT_ID") {
            self.refresh.client_id = Some(v);
        }
        if let Some(v) = lookup("AUTHGUARD_CLIENT_SECRET") {
            self.refresh.client_secret = Some(v);
        }
        if let Some(v) = lookup("AUTHGUARD_BASE_URL") {
            self.transport.base_url = v;
        }
    }

    /// Reads the master key from the configured environment variable.
    pub fn encryption_key(&self) -> Result<String> {
        std::env::var(&self.store.encryption_key_env).with_context(|| {
            format!(
                "Encryption key not set (expected base64 key in {})",
                self.store.encryption_key_env
            )
        })
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AuthGuardConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
    let config: AuthGuardConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path))?;
    Ok(config)
}
