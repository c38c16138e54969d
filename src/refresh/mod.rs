//! Single-flight credential refresh.
//!
//! Any number of callers may discover an expired credential at once; only
//! one upstream refresh runs per window and every caller that arrived while
//! it was in flight receives its outcome.
//!
//! A request that was already in flight when a window closed may see its
//! 401 afterwards. It passes the window it observed before sending to
//! [`RefreshCoordinator::refresh_since`] and receives the newer outcome
//! instead of refreshing again with a secret that has since rotated.
//!
//! # Flow
//! 1. Under the slot lock: reuse a window completed since the caller's
//!    snapshot, join the in-flight window, or open a new one
//! 2. The window owner's work runs on its own task (callers can be cancelled)
//! 3. Load stored credential, call upstream with its refresh secret
//! 4. Persist the new credential
//! 5. Under the slot lock: clear the slot and publish the outcome

mod http;


pub use http::HttpRefreshClient;

use crate::credentials::Credential;
use crate::error::{RefreshApiError, RefreshFailed, RefreshFailureKind};
use crate::pipeline::FailureClassifier;
use crate::store::SecureCredentialStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upstream endpoint that exchanges a refresh secret for a new credential.
#[async_trait]
pub trait RefreshApi: Send + Sync {
    async fn refresh(&self, refresh_secret: &str) -> Result<Credential, RefreshApiError>;
}

/// Result of one refresh window, shared by all of its waiters.
pub type RefreshOutcome = Result<Credential, RefreshFailed>;

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// The one outstanding refresh, if any.
struct InFlight {
    window: u64,
    outcome: OutcomeReceiver,
}

#[derive(Default)]
struct Slot {
    in_flight: Option<InFlight>,
    /// Most recently closed window and its outcome
    last: Option<(u64, RefreshOutcome)>,
}

enum Entry {
    Completed(RefreshOutcome),
    Pending(u64, OutcomeReceiver),
}

struct Inner {
    api: Arc<dyn RefreshApi>,
    store: Arc<SecureCredentialStore>,
    credential_key: String,
    classifier: Arc<dyn FailureClassifier>,
    slot: Mutex<Slot>,
    windows: AtomicU64,
    upstream_calls: AtomicU64,
}

/// Deduplicates concurrent refreshes of the credential stored under one key.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        api: Arc<dyn RefreshApi>,
        store: Arc<SecureCredentialStore>,
        credential_key: impl Into<String>,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                credential_key: credential_key.into(),
                classifier,
                slot: Mutex::new(Slot::default()),
                windows: AtomicU64::new(0),
                upstream_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a freshly refreshed credential, sharing any refresh already in flight.
    ///
    /// When this returns `Ok`, the credential has already been persisted.
    pub async fn get_refreshed_credential(&self) -> RefreshOutcome {
        self.await_entry(self.join_or_start(None)).await
    }

    /// Like [`get_refreshed_credential`](Self::get_refreshed_credential), but
    /// if a window newer than `seen_window` has already closed, its outcome
    /// is returned without another upstream call.
    ///
    /// `seen_window` comes from [`last_completed_window`](Self::last_completed_window)
    /// taken before the request that was rejected was sent.
    pub async fn refresh_since(&self, seen_window: u64) -> RefreshOutcome {
        self.await_entry(self.join_or_start(Some(seen_window))).await
    }

    /// Id of the most recently closed window, 0 before the first refresh.
    pub fn last_completed_window(&self) -> u64 {
        self.lock_slot().last.as_ref().map_or(0, |(window, _)| *window)
    }

    async fn await_entry(&self, entry: Entry) -> RefreshOutcome {
        let (window, mut outcome) = match entry {
            Entry::Completed(outcome) => return outcome,
            Entry::Pending(window, outcome) => (window, outcome),
        };

        let published = match outcome.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        published.unwrap_or_else(|| {
            Err(RefreshFailed {
                kind: RefreshFailureKind::Unknown,
                message: "Refresh ended without publishing an outcome".to_string(),
                window,
            })
        })
    }

    /// Number of upstream refresh calls made so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.upstream_calls.load(Ordering::SeqCst)
    }

    /// True while a refresh window is open.
    pub fn is_refreshing(&self) -> bool {
        self.lock_slot().in_flight.is_some()
    }

    pub fn credential_key(&self) -> &str {
        &self.inner.credential_key
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reuses a window closed after `seen`, joins the open window, or opens
    /// a new one. Check and register happen under a single lock acquisition.
    fn join_or_start(&self, seen: Option<u64>) -> Entry {
        let mut slot = self.lock_slot();

        if let (Some(seen), Some((window, outcome))) = (seen, slot.last.as_ref()) {
            if *window > seen {
                debug!(window, seen, "Reusing refresh completed since request was sent");
                return Entry::Completed(outcome.clone());
            }
        }

        if let Some(in_flight) = slot.in_flight.as_ref() {
            debug!(window = in_flight.window, "Joining in-flight refresh");
            return Entry::Pending(in_flight.window, in_flight.outcome.clone());
        }

        let window = self.inner.windows.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(None);
        slot.in_flight = Some(InFlight {
            window,
            outcome: rx.clone(),
        });
        drop(slot);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let worker = Arc::clone(&inner);
            let outcome = match tokio::spawn(async move { worker.run_refresh(window).await }).await
            {
                Ok(outcome) => outcome,
                Err(e) => Err(RefreshFailed {
                    kind: RefreshFailureKind::Unknown,
                    message: format!("Refresh task failed: {}", e),
                    window,
                }),
            };
            inner.finish(window, tx, outcome);
        });

        Entry::Pending(window, rx)
    }
}

impl Inner {
    async fn run_refresh(&self, window: u64) -> RefreshOutcome {
        let fail = |kind: RefreshFailureKind, message: String| RefreshFailed {
            kind,
            message,
            window,
        };

        let current = match self.store.load_credential(&self.credential_key).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return Err(fail(
                    RefreshFailureKind::Unauthorized,
                    "No stored credential to refresh".to_string(),
                ))
            }
            Err(e) => {
                return Err(fail(
                    RefreshFailureKind::Unknown,
                    format!("Failed to load stored credential: {}", e),
                ))
            }
        };

        let refresh_secret = match current.refresh_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret.to_string(),
            _ => {
                return Err(fail(
                    RefreshFailureKind::Unauthorized,
                    "Stored credential has no refresh secret".to_string(),
                ))
            }
        };

        info!(key = %self.credential_key, window, "Refreshing credential");
        self.upstream_calls.fetch_add(1, Ordering::SeqCst);

        let refreshed = match self.api.refresh(&refresh_secret).await {
            Ok(credential) => credential,
            Err(e) => {
                let kind = self.classifier.classify_refresh(&e);
                warn!(key = %self.credential_key, window, %kind, error = %e, "Credential refresh failed");
                return Err(fail(kind, e.to_string()));
            }
        };

        // Keep the existing refresh secret if upstream did not rotate it
        let refreshed = if refreshed.has_refresh_secret() {
            refreshed
        } else {
            Credential {
                refresh_secret: Some(refresh_secret),
                ..refreshed
            }
        };

        if let Err(e) = self
            .store
            .save_credential(&refreshed, &self.credential_key)
            .await
        {
            error!(key = %self.credential_key, window, error = %e, "Failed to persist refreshed credential");
            return Err(fail(
                RefreshFailureKind::Unknown,
                format!("Failed to persist refreshed credential: {}", e),
            ));
        }

        info!(key = %self.credential_key, window, "Credential refreshed");
        Ok(refreshed)
    }

    /// Closes `window`, records it as the latest, and publishes its outcome
    /// in one critical section.
    fn finish(
        &self,
        window: u64,
        tx: watch::Sender<Option<RefreshOutcome>>,
        outcome: RefreshOutcome,
    ) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.window == window)
        {
            slot.in_flight = None;
        }
        if slot.last.as_ref().map_or(true, |(last, _)| *last < window) {
            slot.last = Some((window, outcome.clone()));
        }
        tx.send_replace(Some(outcome));
    }
}
