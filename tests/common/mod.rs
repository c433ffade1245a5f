//! Shared fakes and helpers for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use geosync::{
    FetchResult, HttpRequest, HttpResponse, HttpTransport, LocationSample, PushLocationProvider,
    RecordFetcher, RemoteRecord, SyncConfig, SyncErrorKind, SyncRequest, TransportError,
};
use tokio::sync::Semaphore;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with every delay shortened and the filters relaxed so tests drive
/// the scheduler directly.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.location.min_interval_secs = 0.0;
    config.location.min_displacement_meters = 0.0;
    config.location.retry_base_ms = 10;
    config.location.retry_cap_ms = 50;
    config.location.retry_jitter = 0.0;
    config.location.max_retry_window_secs = 0;
    config.location.one_shot_timeout_ms = 0;
    config.fetch.retry_delays_ms = vec![0, 0];
    config.scheduler.timer_interval_secs = 0;
    config
}

pub fn sample(latitude: f64, longitude: f64) -> LocationSample {
    LocationSample::new(latitude, longitude, 5.0, Utc::now())
}

pub fn record(id: &str, valid_until: DateTime<Utc>) -> RemoteRecord {
    RemoteRecord {
        id: id.to_string(),
        value: serde_json::json!({"temp": 5}),
        valid_until,
    }
}

pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_subscribed(provider: &PushLocationProvider) {
    eventually("location subscription", || provider.is_subscribed()).await;
}

// ============================================================================
// Fetcher
// ============================================================================

struct FetcherState {
    requests: Mutex<Vec<SyncRequest>>,
    outcomes: Mutex<VecDeque<Result<RemoteRecord, SyncErrorKind>>>,
    gate: Semaphore,
    gated: AtomicBool,
    active: AtomicU64,
    max_active: AtomicU64,
    completed: AtomicU64,
}

impl Default for FetcherState {
    fn default() -> Self {
        Self {
            requests: Mutex::default(),
            outcomes: Mutex::default(),
            gate: Semaphore::new(0),
            gated: AtomicBool::new(false),
            active: AtomicU64::new(0),
            max_active: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }
}

/// Record fetcher with scripted outcomes and an optional gate that holds
/// every fetch until released. Clones share state.
#[derive(Clone, Default)]
pub struct TestFetcher {
    state: Arc<FetcherState>,
}

impl TestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for [`TestFetcher::release`].
    pub fn gated() -> Self {
        let fetcher = Self::default();
        fetcher.state.gated.store(true, Ordering::SeqCst);
        fetcher
    }

    pub fn release(&self, fetches: usize) {
        self.state.gate.add_permits(fetches);
    }

    pub fn push_outcome(&self, outcome: Result<RemoteRecord, SyncErrorKind>) {
        self.state.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> u64 {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

impl RecordFetcher for TestFetcher {
    async fn fetch(&self, request: SyncRequest) -> FetchResult {
        self.state.requests.lock().unwrap().push(request.clone());
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);

        if self.state.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.state.gate.acquire().await {
                permit.forget();
            }
        }

        let outcome = self
            .state
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(record(&format!("rec-{}", request.id.0), Utc::now() + chrono::Duration::hours(1))));
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.completed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(payload) => FetchResult::success(request, payload, 1),
            Err(kind) => FetchResult::failure(request, kind, 1),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// HTTP transport replaying canned responses.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<HttpResponse, TransportError>>>>,
    sent: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            sent: Arc::default(),
        }
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.sent.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Unreachable("script exhausted".into())))
    }
}
