//! OAuth 2.0 refresh-token grant over HTTP.

use super::RefreshApi;
use crate::credentials::Credential;
use crate::error::RefreshApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Token response from an OAuth token refresh endpoint.
#[derive(Deserialize, Debug)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refreshes credentials against an OAuth token endpoint.
///
/// POSTs `grant_type=refresh_token` as a form, with client credentials when
/// configured. A response without `refresh_token` yields a credential with
/// no refresh secret; the coordinator carries the previous one forward.
#[derive(Clone, Debug)]
pub struct HttpRefreshClient {
    http_client: reqwest::Client,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    default_lifetime: Duration,
}

impl HttpRefreshClient {
    /// # Arguments
    /// * `token_url` - OAuth token endpoint URL
    /// * `timeout` - Overall request timeout
    pub fn new(token_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build refresh HTTP client")?;

        Ok(Self {
            http_client,
            token_url: token_url.into(),
            client_id: None,
            client_secret: None,
            default_lifetime: Duration::seconds(DEFAULT_LIFETIME_SECS),
        })
    }

    pub fn with_client_credentials(
        mut self,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        self.client_id = client_id.filter(|s| !s.is_empty());
        self.client_secret = client_secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_default_lifetime(mut self, seconds: i64) -> Self {
        self.default_lifetime = Duration::seconds(seconds.max(1));
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl RefreshApi for HttpRefreshClient {
    async fn refresh(&self, refresh_secret: &str) -> Result<Credential, RefreshApiError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_secret);
        if let Some(client_id) = &self.client_id {
            form.insert("client_id", client_id);
        }
        if let Some(client_secret) = &self.client_secret {
            form.insert("client_secret", client_secret);
        }

        tracing::debug!("Requesting token refresh at {}", self.token_url);

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    RefreshApiError::Other(format!("Invalid refresh request: {}", e))
                } else {
                    RefreshApiError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(RefreshApiError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RefreshApiError::Network(format!("Failed to read refresh response: {}", e)))?;

        let token_response: TokenRefreshResponse = serde_json::from_slice(&body)
            .map_err(|e| RefreshApiError::Malformed(format!("Failed to parse token refresh response: {}", e)))?;

        if token_response.access_token.is_empty() {
            return Err(RefreshApiError::Malformed(
                "Token refresh response has an empty access_token".to_string(),
            ));
        }

        tracing::debug!(
            "Token refresh successful, has_refresh_token={}, expires_in={:?}",
            token_response.refresh_token.is_some(),
            token_response.expires_in
        );

        let lifetime = token_response
            .expires_in
            .map(Duration::seconds)
            .unwrap_or(self.default_lifetime);

        Ok(Credential {
            access_secret: token_response.access_token,
            expiry: Utc::now() + lifetime,
            refresh_secret: token_response.refresh_token.filter(|s| !s.is_empty()),
        })
    }
}
