//! # GeoSync
//!
//! Lifecycle-aware, location-triggered sync engine for mobile hosts.
//!
//! The pipeline observes device location, decides when a sync with a remote
//! endpoint is due, fetches one JSON record per sync and stores it locally so
//! the UI can read it while offline. It follows the host's foreground /
//! background / terminate lifecycle.
//!
//! ```text
//! LocationSource --samples--> SyncEngine (SyncScheduler + LifecycleCoordinator)
//!                                  |                 |
//!                           NetworkFetcher      RecordStore
//! ```
//!
//! ## Features
//!
//! - **`ffi`** - Enable UniFFI bindings for mobile platforms (iOS/Android)
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use geosync::{NetworkFetcher, PushLocationProvider, SqliteStore, SyncConfig, SyncEngine};
//!
//! # async fn run() -> geosync::Result<()> {
//! let config = SyncConfig::from_json(r#"{"fetch":{"baseUrl":"https://api.example.com"}}"#)?;
//! let provider = Arc::new(PushLocationProvider::new());
//! let fetcher = NetworkFetcher::from_config(config.fetch.clone())?;
//! let store = Arc::new(SqliteStore::open("records.db")?);
//!
//! let engine = SyncEngine::spawn(config, provider, fetcher, store)?;
//! engine.on_foreground()?;
//! // ...
//! engine.terminate().await;
//! # Ok(())
//! # }
//! ```

// Unified error handling
pub mod error;
pub use error::{GeoSyncError, Result, SyncErrorKind};

// Data model
pub mod types;
pub use types::{
    bucket_key, FetchResult, LifecyclePhase, LocationSample, PersistedRecord, RemoteRecord,
    RequestId, SyncOutcome, SyncRequest, SyncState, TriggerReason, UNLOCATED_KEY,
};

// Configuration
pub mod config;
pub use config::{
    BackgroundPolicy, BackpressurePolicy, DesiredAccuracy, FetchConfig, HttpMethod,
    LifecycleConfig, LocationConfig, SchedulerConfig, StoreConfig, SyncConfig,
};

// Backoff schedules
pub mod retry;
pub use retry::ExponentialBackoff;

// Location sampling
pub mod location;
pub use location::{
    LocationCallback, LocationEvent, LocationHistory, LocationProvider, LocationRequest,
    LocationSource, ProviderEvent, ProviderFault, PushLocationProvider, SampleQueue,
};

// Remote fetch
pub mod http;
pub use http::{
    HttpRequest, HttpResponse, HttpTransport, NetworkFetcher, RecordFetcher, ReqwestTransport,
    TransportError,
};

// Local storage
pub mod migrations;
pub mod persistence;
pub use persistence::{MemoryStore, RecordStore, SqliteStore};

// Scheduling and lifecycle
pub mod lifecycle;
pub mod scheduler;
pub use lifecycle::{LifecycleAction, LifecycleCoordinator, LifecycleSignal};
pub use scheduler::{Admission, DropReason, SchedulerPhase, SchedulerStats, SyncScheduler};

// Coordination context
pub mod engine;
pub use engine::{SyncEngine, SyncEngineHandle, SyncStatus};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("geosync"),
    );
}

/// No-op on non-Android platforms; the host installs its own logger.
#[cfg(not(target_os = "android"))]
pub fn init_logging() {}
