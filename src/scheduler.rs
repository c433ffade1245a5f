//! Sync scheduling state machine.
//!
//! Decides which triggers become [`SyncRequest`]s and guarantees at most one
//! request is in flight. The scheduler is synchronous and owns no I/O: the
//! engine feeds it triggers and completions and acts on what it returns.
//!
//! ```text
//! Idle --trigger--> Admitted --dispatch--> InFlight --result--> Settling --persisted--> Idle
//! ```
//!
//! While a request is InFlight or Settling, and once the pipeline is Stopped,
//! new triggers are dropped. A pending (Admitted, not yet dispatched) request
//! can be replaced by a higher-priority trigger:
//! Manual > LocationChange > TimerElapsed. A LocationChange also replaces an
//! older pending LocationChange.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::types::{LifecyclePhase, LocationSample, RequestId, SyncRequest, SyncState, TriggerReason};

/// Where the scheduler currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    Idle,
    Admitted,
    InFlight,
    Settling,
}

/// Why a trigger was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The pipeline has stopped.
    Stopped,
    /// A request is in flight or settling.
    Busy,
    /// Not far enough from the last admitted location.
    BelowDisplacement,
    /// A pending request of equal or higher priority already exists.
    Superseded,
}

/// What the scheduler did with a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(RequestId),
    /// Admitted in place of a pending request.
    Replaced { replaced: RequestId, by: RequestId },
    Dropped(DropReason),
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub admitted: u64,
    pub replaced: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub orphaned: u64,
    /// Highest number of fetches observed running at once.
    pub max_concurrent_fetches: u64,
}

/// Sync scheduler. Every method takes the engine-owned [`SyncState`].
pub struct SyncScheduler {
    config: SchedulerConfig,
    next_id: u64,
    pending: Option<SyncRequest>,
    settling: bool,
    anchor: Option<LocationSample>,
    latest_sample: Option<LocationSample>,
    stats: SchedulerStats,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            next_id: 1,
            pending: None,
            settling: false,
            anchor: None,
            latest_sample: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn phase(&self, state: &SyncState) -> SchedulerPhase {
        if self.settling {
            SchedulerPhase::Settling
        } else if state.in_flight_request_id.is_some() {
            SchedulerPhase::InFlight
        } else if self.pending.is_some() {
            SchedulerPhase::Admitted
        } else {
            SchedulerPhase::Idle
        }
    }

    /// Offer a trigger.
    ///
    /// `sample` is the location that caused a LocationChange trigger, or a
    /// fresh fix obtained for a Manual one. Manual and TimerElapsed requests
    /// carry the most recent sample seen. Every admitted request that carries
    /// a sample moves the displacement anchor to it.
    pub fn trigger(
        &mut self,
        state: &SyncState,
        reason: TriggerReason,
        sample: Option<LocationSample>,
        now: DateTime<Utc>,
    ) -> Admission {
        if let Some(sample) = sample {
            self.latest_sample = Some(sample);
        }

        let admission = self.admit(state, reason, sample, now);
        match admission {
            Admission::Admitted(id) => {
                self.stats.admitted += 1;
                debug!("[SyncScheduler] {:?} admitted as {}", reason, id);
            }
            Admission::Replaced { replaced, by } => {
                self.stats.admitted += 1;
                self.stats.replaced += 1;
                debug!("[SyncScheduler] {:?} {} replaced {}", reason, by, replaced);
            }
            Admission::Dropped(why) => {
                self.stats.dropped += 1;
                debug!("[SyncScheduler] {:?} dropped: {:?}", reason, why);
            }
        }
        admission
    }

    fn admit(
        &mut self,
        state: &SyncState,
        reason: TriggerReason,
        sample: Option<LocationSample>,
        now: DateTime<Utc>,
    ) -> Admission {
        if state.lifecycle_phase == LifecyclePhase::Stopped {
            return Admission::Dropped(DropReason::Stopped);
        }
        if state.in_flight_request_id.is_some() || self.settling {
            return Admission::Dropped(DropReason::Busy);
        }

        if reason == TriggerReason::LocationChange {
            if let (Some(sample), Some(anchor)) = (&sample, &self.anchor) {
                if sample.distance_to(anchor) < self.config.min_displacement_meters {
                    return Admission::Dropped(DropReason::BelowDisplacement);
                }
            }
        }

        let replaced = match &self.pending {
            None => None,
            Some(pending) => {
                let outranks = reason.priority() > pending.trigger_reason.priority();
                let newer_location = reason == TriggerReason::LocationChange
                    && pending.trigger_reason == TriggerReason::LocationChange;
                if !(outranks || newer_location) {
                    return Admission::Dropped(DropReason::Superseded);
                }
                Some(pending.id)
            }
        };

        let request_sample = match reason {
            TriggerReason::LocationChange => sample.or(self.latest_sample),
            _ => self.latest_sample,
        };
        if let Some(sample) = request_sample {
            self.anchor = Some(sample);
        }

        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.pending = Some(SyncRequest {
            id,
            trigger_reason: reason,
            sample: request_sample,
            issued_at: now,
        });

        match replaced {
            Some(replaced) => Admission::Replaced { replaced, by: id },
            None => Admission::Admitted(id),
        }
    }

    /// Move the pending request in flight. Returns it for the engine to fetch.
    pub fn dispatch(&mut self, state: &mut SyncState) -> Option<SyncRequest> {
        if state.lifecycle_phase == LifecyclePhase::Stopped
            || state.in_flight_request_id.is_some()
            || self.settling
        {
            return None;
        }
        let request = self.pending.take()?;
        state.in_flight_request_id = Some(request.id);
        self.stats.dispatched += 1;
        Some(request)
    }

    /// A fetch result arrived. Returns false for orphans (results whose
    /// request is no longer in flight); those must be discarded.
    pub fn begin_settle(&mut self, state: &SyncState, id: RequestId) -> bool {
        if self.settling || state.in_flight_request_id != Some(id) {
            self.stats.orphaned += 1;
            debug!("[SyncScheduler] Discarding orphaned result for {}", id);
            return false;
        }
        self.settling = true;
        true
    }

    /// Settle finished (persisted or failed). Returns false for orphans.
    pub fn complete(&mut self, state: &mut SyncState, id: RequestId, succeeded: bool, at: DateTime<Utc>) -> bool {
        if state.in_flight_request_id != Some(id) {
            self.stats.orphaned += 1;
            debug!("[SyncScheduler] Discarding orphaned completion for {}", id);
            return false;
        }
        state.in_flight_request_id = None;
        self.settling = false;
        if succeeded {
            state.last_successful_sync_at = Some(at);
            self.stats.succeeded += 1;
        } else {
            self.stats.failed += 1;
        }
        true
    }

    /// Drop the pending request and forget the in-flight one. Late results
    /// for it become orphans.
    pub fn cancel(&mut self, state: &mut SyncState) -> Option<RequestId> {
        self.pending = None;
        self.settling = false;
        state.in_flight_request_id.take()
    }

    pub fn pending(&self) -> Option<&SyncRequest> {
        self.pending.as_ref()
    }

    pub fn latest_sample(&self) -> Option<LocationSample> {
        self.latest_sample
    }

    /// Record a location seen without triggering a sync (e.g. while busy).
    pub fn observe_sample(&mut self, sample: LocationSample) {
        self.latest_sample = Some(sample);
    }

    pub fn record_concurrency(&mut self, active_fetches: u64) {
        self.stats.max_concurrent_fetches = self.stats.max_concurrent_fetches.max(active_fetches);
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
