//! Credential validity and route policies.

use crate::credentials::Credential;
use crate::pipeline::OutboundRequest;
use chrono::{DateTime, Duration, Utc};

/// Decides whether a stored credential may still be sent.
pub trait TokenValidationStrategy: Send + Sync {
    fn is_valid(&self, credential: &Credential, now: DateTime<Utc>) -> bool;
}

/// Valid while `expiry` is later than `now + leeway`.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryValidation {
    leeway: Duration,
}

impl ExpiryValidation {
    pub fn new(leeway: Duration) -> Self {
        Self {
            leeway: leeway.max(Duration::zero()),
        }
    }

    pub fn with_leeway_seconds(seconds: i64) -> Self {
        Self::new(Duration::seconds(seconds))
    }
}

impl Default for ExpiryValidation {
    fn default() -> Self {
        Self::new(Duration::zero())
    }
}

impl TokenValidationStrategy for ExpiryValidation {
    fn is_valid(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        !credential.access_secret.is_empty() && !credential.is_expired_at(now + self.leeway)
    }
}

/// Decides whether an outbound request needs a credential at all.
pub trait RouteAuthenticationPolicy: Send + Sync {
    fn requires_auth(&self, request: &OutboundRequest) -> bool;
}

/// Everything requires auth except paths under a public prefix.
#[derive(Debug, Clone)]
pub struct PublicPrefixPolicy {
    public_prefixes: Vec<String>,
}

impl PublicPrefixPolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            public_prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn public_prefixes(&self) -> &[String] {
        &self.public_prefixes
    }
}

impl Default for PublicPrefixPolicy {
    fn default() -> Self {
        Self::new(["/public"])
    }
}

impl RouteAuthenticationPolicy for PublicPrefixPolicy {
    fn requires_auth(&self, request: &OutboundRequest) -> bool {
        let path = request.path();
        !self.public_prefixes.iter().any(|prefix| {
            // "/public" matches "/public" and "/public/x" but not "/publications"
            path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                rest.is_empty() || prefix.ends_with('/') || rest.starts_with(|c: char| c == '/' || c == '?')
            })
        })
    }
}

/// Every request carries a credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAuthenticate;

impl RouteAuthenticationPolicy for AlwaysAuthenticate {
    fn requires_auth(&self, _request: &OutboundRequest) -> bool {
        true
    }
}

/// Adapts a closure into a route policy.
pub struct FnRoutePolicy<F>(pub F);

impl<F> RouteAuthenticationPolicy for FnRoutePolicy<F>
where
    F: Fn(&OutboundRequest) -> bool + Send + Sync,
{
    fn requires_auth(&self, request: &OutboundRequest) -> bool {
        (self.0)(request)
    }
}
