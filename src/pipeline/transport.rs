//! HTTP transport backed by reqwest.

use super::{OutboundRequest, Transport, TransportResponse};
use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Sends requests to `base_url` + request path.
///
/// Non-success statuses come back as [`TransportError::Status`]; connect
/// failures and timeouts as [`TransportError::Network`].
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn map_send_error(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::Other(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let url = self.url_for(request.path());

        tracing::debug!(request_id = %request.id(), method = %request.method(), %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await.map_err(map_send_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to read response body: {}", e)))?
            .to_vec();

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
