//! FFI bindings for mobile platforms (iOS/Android).
//!
//! The host shell owns one engine per process, kept in a global slot together
//! with the tokio runtime it runs on. The shell forwards lifecycle callbacks
//! and platform location fixes, and polls status as JSON. All functions are
//! prefixed with `geosync_`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

use crate::config::SyncConfig;
use crate::engine::{SyncEngine, SyncEngineHandle};
use crate::error::Result;
use crate::http::NetworkFetcher;
use crate::location::{LocationRequest, ProviderFault, PushLocationProvider};
use crate::persistence::{RecordStore, SqliteStore};
use crate::types::LocationSample;

struct FfiEngine {
    runtime: Runtime,
    handle: SyncEngineHandle,
    provider: Arc<PushLocationProvider>,
    store: Arc<SqliteStore>,
}

static GEOSYNC: Lazy<Mutex<Option<FfiEngine>>> = Lazy::new(|| Mutex::new(None));

fn with_geosync<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&FfiEngine) -> R,
{
    let guard = GEOSYNC.lock().ok()?;
    guard.as_ref().map(f)
}

fn build(db_path: &str, config_json: &str) -> Result<FfiEngine> {
    let config = if config_json.trim().is_empty() {
        SyncConfig::default()
    } else {
        SyncConfig::from_json(config_json)?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("geosync")
        .enable_all()
        .build()
        .map_err(|e| crate::GeoSyncError::config(format!("Failed to create runtime: {}", e)))?;

    let provider = Arc::new(PushLocationProvider::new());
    let store = Arc::new(SqliteStore::open(db_path)?);
    let fetcher = NetworkFetcher::from_config(config.fetch.clone())?;

    let handle = {
        let _entered = runtime.enter();
        SyncEngine::spawn(config, Arc::clone(&provider), fetcher, Arc::clone(&store))?
    };

    Ok(FfiEngine {
        runtime,
        handle,
        provider,
        store,
    })
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Start the engine. `config_json` may be empty for defaults.
/// Returns false if initialization failed.
#[uniffi::export]
pub fn geosync_init(db_path: String, config_json: String) -> bool {
    crate::init_logging();
    info!("[GeoSync] Initializing with db: {}", db_path);

    let Ok(mut guard) = GEOSYNC.lock() else {
        return false;
    };
    if guard.is_some() {
        info!("[GeoSync] Already initialized");
        return true;
    }
    match build(&db_path, &config_json) {
        Ok(engine) => {
            *guard = Some(engine);
            info!("[GeoSync] Initialized successfully");
            true
        }
        Err(e) => {
            warn!("[GeoSync] Failed to initialize: {}", e);
            false
        }
    }
}

#[uniffi::export]
pub fn geosync_is_initialized() -> bool {
    GEOSYNC.lock().map(|guard| guard.is_some()).unwrap_or(false)
}

#[uniffi::export]
pub fn geosync_on_foreground() -> bool {
    with_geosync(|e| e.handle.on_foreground().is_ok()).unwrap_or(false)
}

#[uniffi::export]
pub fn geosync_on_background() -> bool {
    with_geosync(|e| e.handle.on_background().is_ok()).unwrap_or(false)
}

/// Stop the engine and release the runtime. Blocks until the store is closed.
#[uniffi::export]
pub fn geosync_on_terminate() {
    let engine = match GEOSYNC.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    if let Some(engine) = engine {
        engine.runtime.block_on(engine.handle.terminate());
        engine.runtime.shutdown_timeout(Duration::from_secs(2));
        info!("[GeoSync] Terminated");
    }
}

#[uniffi::export]
pub fn geosync_request_sync() -> bool {
    with_geosync(|e| e.handle.request_sync().is_ok()).unwrap_or(false)
}

// ============================================================================
// Location bridge
// ============================================================================

/// Platform location fault forwarded by the host.
#[derive(Debug, Clone, Copy, uniffi::Enum)]
pub enum FfiLocationFault {
    PermissionDenied,
    Timeout,
    /// Provider switched off or temporarily failing.
    Unavailable,
}

/// What the platform should currently deliver.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiLocationRequest {
    pub accuracy: String,
    pub interval_ms: u64,
    pub min_displacement_meters: f64,
}

/// Forward a platform fix. Pass a negative accuracy when unknown.
#[uniffi::export]
pub fn geosync_push_location(latitude: f64, longitude: f64, accuracy_meters: f64, timestamp_ms: i64) -> bool {
    let captured_at = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);
    let accuracy = if accuracy_meters >= 0.0 {
        accuracy_meters
    } else {
        f64::NAN
    };
    let sample = LocationSample::new(latitude, longitude, accuracy, captured_at);
    with_geosync(|e| e.provider.push_sample(sample)).unwrap_or(false)
}

#[uniffi::export]
pub fn geosync_push_location_fault(fault: FfiLocationFault) -> bool {
    let fault = match fault {
        FfiLocationFault::PermissionDenied => ProviderFault::PermissionDenied,
        FfiLocationFault::Timeout => ProviderFault::Timeout,
        FfiLocationFault::Unavailable => ProviderFault::Transient("reported by host".to_string()),
    };
    with_geosync(|e| e.provider.push_fault(fault)).unwrap_or(false)
}

impl From<LocationRequest> for FfiLocationRequest {
    fn from(request: LocationRequest) -> Self {
        Self {
            accuracy: format!("{:?}", request.accuracy),
            interval_ms: request.interval.as_millis() as u64,
            min_displacement_meters: request.min_displacement_meters,
        }
    }
}

/// Current subscription, or None when location updates should be off.
#[uniffi::export]
pub fn geosync_location_request() -> Option<FfiLocationRequest> {
    with_geosync(|e| e.provider.current_request())
        .flatten()
        .map(FfiLocationRequest::from)
}

/// Pending single-fix request. While set, the host should obtain one current
/// fix and forward it with `geosync_push_location`.
#[uniffi::export]
pub fn geosync_one_shot_request() -> Option<FfiLocationRequest> {
    with_geosync(|e| e.provider.pending_one_shot())
        .flatten()
        .map(FfiLocationRequest::from)
}

// ============================================================================
// Queries
// ============================================================================

/// Current [`crate::SyncStatus`] as JSON.
#[uniffi::export]
pub fn geosync_status_json() -> String {
    with_geosync(|e| serde_json::to_string(&e.handle.status()).unwrap_or_else(|_| "{}".to_string()))
        .unwrap_or_else(|| "{}".to_string())
}

/// Most recently stored record as JSON, if any.
#[uniffi::export]
pub fn geosync_latest_record_json() -> Option<String> {
    with_geosync(|e| match e.store.latest() {
        Ok(record) => record.and_then(|r| serde_json::to_string(&r).ok()),
        Err(err) => {
            warn!("[GeoSync] latest record failed: {}", err);
            None
        }
    })
    .flatten()
}

/// Stored record for a coordinate's bucket as JSON, if any. Buckets use the
/// size the engine was configured with.
#[uniffi::export]
pub fn geosync_record_for_location_json(latitude: f64, longitude: f64) -> Option<String> {
    with_geosync(|e| {
        let key = e.handle.record_key_for(latitude, longitude);
        match e.store.get(&key) {
            Ok(record) => record.and_then(|r| serde_json::to_string(&r).ok()),
            Err(err) => {
                warn!("[GeoSync] record {} failed: {}", key, err);
                None
            }
        }
    })
    .flatten()
}
