//! Bearer header handling and the two auth policies consulted per request.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use thiserror::Error;

mod policy;


pub use policy::{
    AlwaysAuthenticate, ExpiryValidation, FnRoutePolicy, PublicPrefixPolicy,
    RouteAuthenticationPolicy, TokenValidationStrategy,
};

/// Builds the `Authorization` value for `secret`, marked sensitive so it is
/// redacted from `Debug` output.
pub fn bearer_header_value(secret: &str) -> Result<HeaderValue, TokenError> {
    if secret.trim().is_empty() {
        return Err(TokenError::Empty);
    }

    let mut value = HeaderValue::from_str(&format!("Bearer {}", secret))
        .map_err(|_| TokenError::InvalidFormat)?;
    value.set_sensitive(true);
    Ok(value)
}

/// Sets (or replaces) the bearer `Authorization` header.
pub fn attach_bearer(headers: &mut HeaderMap, secret: &str) -> Result<(), TokenError> {
    headers.insert(AUTHORIZATION, bearer_header_value(secret)?);
    Ok(())
}

/// Errors building a bearer header
#[derive(Debug, PartialEq, Clone, Error)]
pub enum TokenError {
    /// Secret is not a valid header value
    #[error("Invalid authorization token format")]
    InvalidFormat,
    /// Secret is empty or whitespace
    #[error("Authorization token is empty")]
    Empty,
}
