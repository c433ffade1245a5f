//! Pipeline configuration.
//!
//! Every numeric default here is a starting configuration, not a protocol
//! constant: hosts override them through [`SyncConfig::from_json`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GeoSyncError, Result};

/// Requested fix quality, forwarded to the platform provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DesiredAccuracy {
    High,
    #[default]
    Balanced,
    Low,
}

/// What to do with location events when the coordination queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued event and enqueue the new one.
    #[default]
    DropOldest,
    /// Discard the new event.
    DropLatest,
}

/// Location sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocationConfig {
    /// Minimum time between emitted samples (foreground cadence).
    pub min_interval_secs: f64,
    /// Minimum movement before a new sample is emitted.
    pub min_displacement_meters: f64,
    pub desired_accuracy: DesiredAccuracy,
    /// First provider retry delay.
    pub retry_base_ms: u64,
    /// Provider retry delay cap.
    pub retry_cap_ms: u64,
    /// Relative jitter applied to each retry delay (0.2 = +/-20%).
    pub retry_jitter: f64,
    /// How long the provider may fail before ProviderUnavailable is reported.
    pub max_retry_window_secs: u64,
    /// Capacity of the sample history ring buffer.
    pub history_size: usize,
    /// Accept samples without accuracy in `latest_valid` queries that filter on accuracy.
    pub accept_missing_accuracy: bool,
    /// Capacity of the queue into the coordination context.
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// How long a manual sync waits for a one-shot fix when no recent sample
    /// is known. 0 disables one-shot fixes.
    pub one_shot_timeout_ms: u64,
    /// Samples younger than this make a one-shot fix unnecessary.
    pub fresh_fix_max_age_secs: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 5.0,
            min_displacement_meters: 50.0,
            desired_accuracy: DesiredAccuracy::Balanced,
            retry_base_ms: 1_000,
            retry_cap_ms: 30_000,
            retry_jitter: 0.2,
            max_retry_window_secs: 120,
            history_size: 20,
            accept_missing_accuracy: false,
            queue_capacity: 8,
            backpressure: BackpressurePolicy::DropOldest,
            one_shot_timeout_ms: 10_000,
            fresh_fix_max_age_secs: 60,
        }
    }
}

impl LocationConfig {
    pub fn min_interval(&self) -> Duration {
        self.interval_at(1.0)
    }

    /// Sampling interval at `multiplier` times the base cadence. Saturates
    /// at `Duration::MAX` for values no `Duration` can hold.
    pub fn interval_at(&self, multiplier: f64) -> Duration {
        Duration::try_from_secs_f64(self.min_interval_secs * multiplier).unwrap_or(Duration::MAX)
    }

    pub fn max_retry_window(&self) -> Duration {
        Duration::from_secs(self.max_retry_window_secs)
    }

    /// None when one-shot fixes are disabled.
    pub fn one_shot_timeout(&self) -> Option<Duration> {
        (self.one_shot_timeout_ms > 0).then(|| Duration::from_millis(self.one_shot_timeout_ms))
    }

    pub fn fresh_fix_max_age(&self) -> Duration {
        Duration::from_secs(self.fresh_fix_max_age_secs)
    }
}

/// HTTP method used to query the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Network fetch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    /// Scheme and host of the endpoint, e.g. `https://api.example.com`.
    pub base_url: String,
    pub path: String,
    pub method: HttpMethod,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Automatic retries for Timeout / NetworkUnreachable.
    pub max_retries: u32,
    /// Delay before each retry. The last entry is reused if there are more
    /// retries than entries.
    pub retry_delays_ms: Vec<u64>,
    /// API key sent as Basic auth (`API_KEY:<key>`).
    pub api_key: Option<String>,
    /// Pre-formatted Authorization header ("Basic ..." or "Bearer ...").
    /// Takes precedence over `api_key`.
    pub auth_header: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://localhost:8080"),
            path: String::from("/records"),
            method: HttpMethod::Get,
            timeout_ms: 15_000,
            max_retries: 2,
            retry_delays_ms: vec![1_000, 3_000],
            api_key: None,
            auth_header: None,
            user_agent: None,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let index = (retry.saturating_sub(1) as usize).min(self.retry_delays_ms.len().saturating_sub(1));
        Duration::from_millis(self.retry_delays_ms.get(index).copied().unwrap_or(0))
    }

    /// Full endpoint URL.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Size of a storage bucket in degrees (0.01 is roughly 1km).
    pub bucket_size_deg: f64,
    /// Remove records past their `validUntil` when the pipeline starts.
    pub purge_expired_on_start: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket_size_deg: 0.01,
            purge_expired_on_start: true,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Displacement from the last admitted sample required to admit a
    /// LocationChange trigger.
    pub min_displacement_meters: f64,
    /// Period of TimerElapsed triggers; 0 disables the timer.
    pub timer_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_displacement_meters: 50.0,
            timer_interval_secs: 900,
        }
    }
}

impl SchedulerConfig {
    pub fn timer_interval(&self) -> Option<Duration> {
        (self.timer_interval_secs > 0).then(|| Duration::from_secs(self.timer_interval_secs))
    }
}

/// What location does while the app is in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackgroundPolicy {
    /// Keep sampling at `min_interval * background_factor`.
    #[default]
    ReducedCadence,
    /// Stop location updates until the next foreground signal.
    StopUpdates,
}

/// Lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Multiplier applied to the sampling interval in the background.
    pub background_factor: f64,
    pub background_policy: BackgroundPolicy,
    /// Start location at background cadence as soon as the pipeline starts.
    pub start_location_on_launch: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            background_factor: 4.0,
            background_policy: BackgroundPolicy::ReducedCadence,
            start_location_on_launch: true,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub location: LocationConfig,
    pub fetch: FetchConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
}

impl SyncConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| GeoSyncError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let loc = &self.location;
        if !(loc.min_interval_secs.is_finite() && loc.min_interval_secs >= 0.0) {
            return Err(GeoSyncError::config("location.minIntervalSecs must be >= 0"));
        }
        if !(loc.min_displacement_meters.is_finite() && loc.min_displacement_meters >= 0.0) {
            return Err(GeoSyncError::config("location.minDisplacementMeters must be >= 0"));
        }
        if loc.retry_base_ms == 0 || loc.retry_cap_ms < loc.retry_base_ms {
            return Err(GeoSyncError::config(
                "location retry base must be positive and not exceed the cap",
            ));
        }
        if !(0.0..1.0).contains(&loc.retry_jitter) {
            return Err(GeoSyncError::config("location.retryJitter must be in [0, 1)"));
        }
        if loc.history_size == 0 || loc.queue_capacity == 0 {
            return Err(GeoSyncError::config(
                "location history and queue capacities must be positive",
            ));
        }

        let fetch = &self.fetch;
        if fetch.base_url.trim().is_empty() {
            return Err(GeoSyncError::config("fetch.baseUrl is empty"));
        }
        if fetch.timeout_ms == 0 {
            return Err(GeoSyncError::config("fetch.timeoutMs must be positive"));
        }
        if fetch.max_retries > 0 && fetch.retry_delays_ms.is_empty() {
            return Err(GeoSyncError::config(
                "fetch.retryDelaysMs must not be empty when retries are enabled",
            ));
        }

        if !(self.store.bucket_size_deg.is_finite() && self.store.bucket_size_deg > 0.0) {
            return Err(GeoSyncError::config("store.bucketSizeDeg must be positive"));
        }
        if !(self.scheduler.min_displacement_meters.is_finite()
            && self.scheduler.min_displacement_meters >= 0.0)
        {
            return Err(GeoSyncError::config("scheduler.minDisplacementMeters must be >= 0"));
        }
        if !(self.lifecycle.background_factor.is_finite() && self.lifecycle.background_factor >= 1.0) {
            return Err(GeoSyncError::config("lifecycle.backgroundFactor must be >= 1"));
        }
        let background_secs = loc.min_interval_secs * self.lifecycle.background_factor;
        if Duration::try_from_secs_f64(background_secs).is_err() {
            return Err(GeoSyncError::config(
                "location.minIntervalSecs * lifecycle.backgroundFactor is out of range",
            ));
        }
        Ok(())
    }
}
