//! Pipeline data model.
//!
//! Samples flow from the location source into the scheduler, become
//! [`SyncRequest`]s, come back from the fetcher as [`FetchResult`]s and end up
//! in the store as [`PersistedRecord`]s. [`SyncState`] is the single piece of
//! shared mutable state and is owned by the coordination context.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SyncErrorKind;

// ============================================================================
// Location
// ============================================================================

/// A single location fix. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters. Non-finite when the provider
    /// did not report one.
    pub accuracy_meters: f64,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            captured_at,
        }
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Accuracy in meters, if the provider reported one.
    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy_meters.is_finite().then_some(self.accuracy_meters)
    }

    /// Great-circle distance to another sample in meters.
    pub fn distance_to(&self, other: &LocationSample) -> f64 {
        use geo::{Distance, Haversine, Point};

        Haversine::distance(
            Point::new(self.longitude, self.latitude),
            Point::new(other.longitude, other.latitude),
        )
    }
}

/// Key used for records fetched without a location.
pub const UNLOCATED_KEY: &str = "unlocated";

/// Derive the storage bucket for a coordinate.
///
/// Each coordinate is rounded to the nearest multiple of `bucket_size_deg`, so
/// nearby fixes share one record instead of growing the key space.
pub fn bucket_key(latitude: f64, longitude: f64, bucket_size_deg: f64) -> String {
    let lat_index = (latitude / bucket_size_deg).round() as i64;
    let lon_index = (longitude / bucket_size_deg).round() as i64;
    format!("b:{}:{}", lat_index, lon_index)
}

// ============================================================================
// Requests and results
// ============================================================================

/// Opaque request token, unique within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Why a sync attempt was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerReason {
    LocationChange,
    TimerElapsed,
    Manual,
}

impl TriggerReason {
    /// Replacement priority for a pending, not yet dispatched request.
    pub fn priority(&self) -> u8 {
        match self {
            TriggerReason::TimerElapsed => 0,
            TriggerReason::LocationChange => 1,
            TriggerReason::Manual => 2,
        }
    }
}

/// A sync attempt accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub id: RequestId,
    pub trigger_reason: TriggerReason,
    pub sample: Option<LocationSample>,
    pub issued_at: DateTime<Utc>,
}

impl SyncRequest {
    /// Storage key this request's result is written under.
    pub fn storage_key(&self, bucket_size_deg: f64) -> String {
        match &self.sample {
            Some(s) => bucket_key(s.latitude, s.longitude, bucket_size_deg),
            None => UNLOCATED_KEY.to_string(),
        }
    }
}

/// Record shape returned by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub value: serde_json::Value,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub valid_until: DateTime<Utc>,
}

/// Accept either an RFC 3339 string or integer Unix seconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Seconds(i64),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom),
        Wire::Seconds(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", secs))),
    }
}

/// Outcome of one fetch, consumed exactly once by the settle step.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub request: SyncRequest,
    pub payload: Option<RemoteRecord>,
    pub error: Option<SyncErrorKind>,
    pub completed_at: DateTime<Utc>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

impl FetchResult {
    pub fn success(request: SyncRequest, payload: RemoteRecord, attempts: u32) -> Self {
        Self {
            request,
            payload: Some(payload),
            error: None,
            completed_at: Utc::now(),
            attempts,
        }
    }

    pub fn failure(request: SyncRequest, error: SyncErrorKind, attempts: u32) -> Self {
        Self {
            request,
            payload: None,
            error: Some(error),
            completed_at: Utc::now(),
            attempts,
        }
    }
}

/// A record as held by the local store. At most one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub key: String,
    pub value: RemoteRecord,
    pub stored_at: DateTime<Utc>,
    pub source_request_id: RequestId,
}

impl PersistedRecord {
    /// Build the record a fetch result is stored as.
    pub fn from_fetch(request: &SyncRequest, payload: RemoteRecord, bucket_size_deg: f64) -> Self {
        Self {
            key: request.storage_key(bucket_size_deg),
            value: payload,
            stored_at: Utc::now(),
            source_request_id: request.id,
        }
    }
}

// ============================================================================
// Pipeline state
// ============================================================================

/// Host process lifecycle phase as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Foreground,
    Background,
    Stopped,
}

/// Process-wide pipeline state. Owned by the coordination context.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub in_flight_request_id: Option<RequestId>,
    pub lifecycle_phase: LifecyclePhase,
}

impl SyncState {
    pub fn new(lifecycle_phase: LifecyclePhase) -> Self {
        Self {
            last_successful_sync_at: None,
            in_flight_request_id: None,
            lifecycle_phase,
        }
    }
}

/// Terminal outcome of an admitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub request_id: RequestId,
    pub trigger: TriggerReason,
    pub error: Option<SyncErrorKind>,
    /// Key written to the store, when the result was persisted.
    pub stored_key: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.stored_key.is_some()
    }
}
