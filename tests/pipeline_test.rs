// Integration tests for the authenticated request pipeline

use async_trait::async_trait;
use authguard::error::RefreshApiError;
use authguard::pipeline::{
    AuthPipeline, ClearStoredCredential, OutboundRequest, SessionTeardown, Transport,
    TransportResponse,
};
use authguard::refresh::RefreshApi;
use authguard::store::{MemoryBackend, SecureCredentialStore};
use authguard::{Credential, PipelineError, RefreshFailureKind, TransportError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const KEY: &str = "session";

/// Server double: accepts one bearer token on protected paths.
struct FakeServer {
    accepted: Mutex<String>,
    /// Status returned for protected paths regardless of auth (if set)
    forced_status: Mutex<Option<u16>>,
    /// Extra latency for paths under `/api/slow`
    slow_delay: Mutex<std::time::Duration>,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeServer {
    fn new(accepted: &str) -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(accepted.to_string()),
            forced_status: Mutex::new(None),
            slow_delay: Mutex::new(std::time::Duration::ZERO),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn accept(&self, token: &str) {
        *self.accepted.lock().unwrap() = token.to_string();
    }

    fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let auth = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.seen
            .lock()
            .unwrap()
            .push((request.path().to_string(), auth.clone()));

        // Auth is checked on arrival; only the answer is delayed
        let expected = format!("Bearer {}", self.accepted.lock().unwrap());
        if request.path().starts_with("/api/slow") {
            let delay = *self.slow_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
        }

        if request.path().starts_with("/public") {
            return Ok(TransportResponse::new(StatusCode::OK, b"public".to_vec()));
        }
        if let Some(status) = *self.forced_status.lock().unwrap() {
            return Err(TransportError::Status {
                status,
                body: Vec::new(),
            });
        }

        if auth.as_deref() == Some(expected.as_str()) {
            Ok(TransportResponse::new(StatusCode::OK, b"ok".to_vec()))
        } else {
            Err(TransportError::Status {
                status: 401,
                body: b"unauthorized".to_vec(),
            })
        }
    }
}

/// Token endpoint double. On success the server starts accepting the new token.
struct FakeRefresh {
    server: Arc<FakeServer>,
    outcome: Result<&'static str, RefreshApiError>,
    delay: std::time::Duration,
    calls: AtomicU32,
}

#[async_trait]
impl RefreshApi for FakeRefresh {
    async fn refresh(&self, refresh_secret: &str) -> Result<Credential, RefreshApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        // Only the original secret is live; rotated ones are never honoured here
        if refresh_secret != "refresh-1" {
            return Err(RefreshApiError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            });
        }

        let token = self.outcome.clone()?;
        self.server.accept(token);
        Ok(Credential::new(
            token,
            Utc::now() + Duration::hours(1),
            Some("refresh-2".to_string()),
        ))
    }
}

/// Counts teardowns, optionally stalls, then clears the stored credential.
struct CountingTeardown {
    inner: ClearStoredCredential,
    delay: std::time::Duration,
    count: AtomicU32,
    completed: AtomicU32,
}

#[async_trait]
impl SessionTeardown for CountingTeardown {
    async fn perform_global_logout(&self) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.perform_global_logout().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    server: Arc<FakeServer>,
    refresh: Arc<FakeRefresh>,
    teardown: Arc<CountingTeardown>,
    store: Arc<SecureCredentialStore>,
    pipeline: AuthPipeline,
}

impl Harness {
    fn refresh_calls(&self) -> u32 {
        self.refresh.calls.load(Ordering::SeqCst)
    }

    fn teardowns(&self) -> u32 {
        self.teardown.count.load(Ordering::SeqCst)
    }
}

fn harness(
    accepted: &str,
    outcome: Result<&'static str, RefreshApiError>,
    delay_ms: u64,
) -> Harness {
    harness_with_teardown_delay(accepted, outcome, delay_ms, 0)
}

fn harness_with_teardown_delay(
    accepted: &str,
    outcome: Result<&'static str, RefreshApiError>,
    delay_ms: u64,
    teardown_delay_ms: u64,
) -> Harness {
    let store = Arc::new(
        SecureCredentialStore::new(Arc::new(MemoryBackend::new()), &BASE64.encode([7u8; 32]))
            .unwrap(),
    );
    let server = FakeServer::new(accepted);
    let refresh = Arc::new(FakeRefresh {
        server: server.clone(),
        outcome,
        delay: std::time::Duration::from_millis(delay_ms),
        calls: AtomicU32::new(0),
    });
    let teardown = Arc::new(CountingTeardown {
        inner: ClearStoredCredential::new(store.clone(), KEY),
        delay: std::time::Duration::from_millis(teardown_delay_ms),
        count: AtomicU32::new(0),
        completed: AtomicU32::new(0),
    });

    let pipeline = AuthPipeline::builder(
        server.clone(),
        store.clone(),
        refresh.clone(),
        teardown.clone(),
    )
    .credential_key(KEY)
    .build();

    Harness {
        server,
        refresh,
        teardown,
        store,
        pipeline,
    }
}

async fn store_credential(h: &Harness, access: &str, expired: bool) {
    let expiry = if expired {
        Utc::now() - Duration::minutes(1)
    } else {
        Utc::now() + Duration::hours(1)
    };
    h.store
        .save_credential(
            &Credential::new(access, expiry, Some("refresh-1".to_string())),
            KEY,
        )
        .await
        .unwrap();
}

fn assert_unauthorized(err: &PipelineError) {
    match err {
        PipelineError::Transport(TransportError::Status { status, .. }) => assert_eq!(*status, 401),
        other => panic!("expected 401 transport error, got {:?}", other),
    }
}

/// Valid stored credential is attached and no refresh happens.
#[tokio::test]
async fn test_valid_credential_attached() {
    let h = harness("token-1", Ok("unused"), 0);
    store_credential(&h, "token-1", false).await;

    let response = h.pipeline.send(OutboundRequest::get("/api/profile")).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.refresh_calls(), 0);
    assert_eq!(
        h.server.seen(),
        vec![("/api/profile".to_string(), Some("Bearer token-1".to_string()))]
    );
}

/// Expired credential goes out without a header, then refresh + retry succeeds.
#[tokio::test]
async fn test_expired_credential_refreshed_and_retried() {
    let h = harness("token-1", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", true).await;

    let response = h.pipeline.send(OutboundRequest::get("/api/profile")).await.unwrap();

    assert_eq!(response.body, b"ok".to_vec());
    assert_eq!(h.refresh_calls(), 1);
    assert_eq!(
        h.server.seen(),
        vec![
            ("/api/profile".to_string(), None),
            ("/api/profile".to_string(), Some("Bearer fresh-token".to_string())),
        ]
    );

    let stored = h.store.load_credential(KEY).await.unwrap().unwrap();
    assert_eq!(stored.access_secret, "fresh-token");
    assert_eq!(stored.refresh_secret.as_deref(), Some("refresh-2"));
}

/// Network failure during refresh surfaces the original 401 and keeps the session.
#[tokio::test]
async fn test_network_refresh_failure_keeps_session() {
    let h = harness(
        "token-1",
        Err(RefreshApiError::Network("connection reset".to_string())),
        0,
    );
    store_credential(&h, "stale-token", false).await;

    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    assert_unauthorized(&err);
    assert!(!err.is_teardown());
    assert_eq!(h.teardowns(), 0);
    assert!(h.store.load_credential(KEY).await.unwrap().is_some());
}

/// Rejected refresh tears the session down and reports it.
#[tokio::test]
async fn test_rejected_refresh_tears_down_session() {
    let h = harness(
        "token-1",
        Err(RefreshApiError::Rejected {
            status: 400,
            body: "invalid_grant".to_string(),
        }),
        0,
    );
    store_credential(&h, "stale-token", false).await;

    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    match err {
        PipelineError::SessionTeardownRequired(failed) => {
            assert_eq!(failed.kind, RefreshFailureKind::Unauthorized)
        }
        other => panic!("expected teardown, got {:?}", other),
    }
    assert_eq!(h.teardowns(), 1);
    assert!(h.store.load_credential(KEY).await.unwrap().is_none());
}

/// Malformed refresh responses are also terminal.
#[tokio::test]
async fn test_malformed_refresh_tears_down_session() {
    let h = harness(
        "token-1",
        Err(RefreshApiError::Malformed("not json".to_string())),
        0,
    );
    store_credential(&h, "stale-token", false).await;

    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    assert!(err.is_teardown());
    assert_eq!(h.teardowns(), 1);
}

/// Unauthorized again after the retry is terminal: no second refresh.
#[tokio::test]
async fn test_second_unauthorized_is_terminal() {
    let h = harness("token-1", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", true).await;
    *h.server.forced_status.lock().unwrap() = Some(401);

    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    assert_unauthorized(&err);
    assert_eq!(h.refresh_calls(), 1);
    assert_eq!(h.server.seen().len(), 2);
    assert_eq!(h.teardowns(), 0);
}

/// Non-auth failures pass through untouched.
#[tokio::test]
async fn test_server_error_not_refreshed() {
    let h = harness("token-1", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", false).await;
    *h.server.forced_status.lock().unwrap() = Some(503);

    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::Transport(TransportError::Status {
            status: 503,
            body: Vec::new()
        })
    );
    assert_eq!(h.refresh_calls(), 0);
}

/// Public routes bypass credential attachment and refresh entirely.
#[tokio::test]
async fn test_public_route_bypasses_auth() {
    let h = harness("token-1", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", false).await;

    let response = h
        .pipeline
        .send(OutboundRequest::get("/public/status"))
        .await
        .unwrap();

    assert_eq!(response.body, b"public".to_vec());
    assert_eq!(h.server.seen(), vec![("/public/status".to_string(), None)]);
    assert_eq!(h.refresh_calls(), 0);
}

/// Caller-supplied Authorization header is not replaced.
#[tokio::test]
async fn test_explicit_authorization_header_kept() {
    let h = harness("caller-token", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", false).await;

    let request = OutboundRequest::get("/api/profile")
        .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer caller-token"));
    h.pipeline.send(request).await.unwrap();

    assert_eq!(
        h.server.seen(),
        vec![("/api/profile".to_string(), Some("Bearer caller-token".to_string()))]
    );
}

/// Many requests hitting an expired credential share a single refresh.
#[tokio::test]
async fn test_concurrent_requests_single_refresh() {
    let h = harness("token-1", Ok("fresh-token"), 100);
    store_credential(&h, "token-1", true).await;

    let results = futures::future::join_all(
        (0..10).map(|i| h.pipeline.send(OutboundRequest::get(format!("/api/items/{}", i)))),
    )
    .await;

    for result in results {
        assert_eq!(result.unwrap().status, StatusCode::OK);
    }
    assert_eq!(h.refresh_calls(), 1);
    assert_eq!(h.pipeline.coordinator().refresh_count(), 1);
    assert!(!h.pipeline.coordinator().is_refreshing());
}

/// Concurrent failures sharing one refresh window tear down once.
#[tokio::test]
async fn test_concurrent_failures_single_teardown() {
    let h = harness(
        "token-1",
        Err(RefreshApiError::Rejected {
            status: 401,
            body: "revoked".to_string(),
        }),
        200,
    );
    store_credential(&h, "stale-token", false).await;

    let results = futures::future::join_all(
        (0..5).map(|_| h.pipeline.send(OutboundRequest::get("/api/profile"))),
    )
    .await;

    for result in results {
        assert!(result.unwrap_err().is_teardown());
    }
    assert_eq!(h.refresh_calls(), 1);
    assert_eq!(h.teardowns(), 1);
}

/// A 401 answered after the refresh already finished reuses its credential.
#[tokio::test]
async fn test_late_unauthorized_reuses_completed_refresh() {
    let h = harness("token-1", Ok("fresh-token"), 50);
    store_credential(&h, "token-1", true).await;
    *h.server.slow_delay.lock().unwrap() = std::time::Duration::from_millis(300);

    let (fast, slow) = tokio::join!(
        h.pipeline.send(OutboundRequest::get("/api/fast")),
        h.pipeline.send(OutboundRequest::get("/api/slow")),
    );

    assert_eq!(fast.unwrap().status, StatusCode::OK);
    assert_eq!(slow.unwrap().status, StatusCode::OK);
    assert_eq!(h.refresh_calls(), 1);

    let slow_retry = h
        .server
        .seen()
        .into_iter()
        .filter(|(path, _)| path == "/api/slow")
        .nth(1)
        .unwrap();
    assert_eq!(slow_retry.1.as_deref(), Some("Bearer fresh-token"));
}

/// A 401 on a request sent after a refresh still triggers a new refresh.
#[tokio::test]
async fn test_unauthorized_after_refresh_refreshes_again() {
    let h = harness("token-1", Ok("fresh-token"), 0);
    store_credential(&h, "token-1", true).await;

    h.pipeline.send(OutboundRequest::get("/api/profile")).await.unwrap();
    assert_eq!(h.refresh_calls(), 1);

    // Server revokes the refreshed token; refresh-2 is rejected upstream
    h.server.accept("revoked");
    let err = h
        .pipeline
        .send(OutboundRequest::get("/api/profile"))
        .await
        .unwrap_err();

    assert!(err.is_teardown());
    assert_eq!(h.refresh_calls(), 2);
}

/// Returns (teardown error?, teardowns completed when the call returned).
async fn send_and_observe_teardown(h: &Harness) -> (bool, u32) {
    let result = h.pipeline.send(OutboundRequest::get("/api/profile")).await;
    (
        result.unwrap_err().is_teardown(),
        h.teardown.completed.load(Ordering::SeqCst),
    )
}

/// Every request failing in one window returns only after teardown finished.
#[tokio::test]
async fn test_teardown_completes_before_any_request_returns() {
    let h = harness_with_teardown_delay(
        "token-1",
        Err(RefreshApiError::Rejected {
            status: 401,
            body: "revoked".to_string(),
        }),
        20,
        300,
    );
    store_credential(&h, "stale-token", false).await;

    let (a, b) = tokio::join!(send_and_observe_teardown(&h), send_and_observe_teardown(&h));

    assert_eq!(a, (true, 1));
    assert_eq!(b, (true, 1));
    assert_eq!(h.teardowns(), 1);
    assert!(h.store.load_credential(KEY).await.unwrap().is_none());
}
