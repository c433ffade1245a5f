//! Host lifecycle handling.
//!
//! [`LifecycleCoordinator`] maps foreground / background / terminate signals
//! onto [`LifecycleAction`]s for the engine to carry out, and keeps
//! `SyncState::lifecycle_phase` current. Repeated signals are deduplicated and
//! everything after termination is ignored.

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{BackgroundPolicy, LifecycleConfig};
use crate::types::{LifecyclePhase, SyncState};

/// Signal from the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleSignal {
    Foreground,
    Background,
    Terminate,
}

/// Side effect requested by the coordinator, applied in order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleAction {
    /// Start location updates at the given cadence multiplier.
    StartLocation { cadence_multiplier: f64 },
    /// Change the cadence of running updates.
    SetCadence { cadence_multiplier: f64 },
    StopLocation,
    /// Issue a Manual sync trigger.
    RequestSync,
    /// Abandon the pending and in-flight requests.
    CancelInFlight,
    /// Release resources and stop the engine.
    Shutdown,
}

pub struct LifecycleCoordinator {
    config: LifecycleConfig,
    location_active: bool,
}

impl LifecycleCoordinator {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            location_active: false,
        }
    }

    /// Actions for pipeline start. The pipeline starts in the Background phase.
    pub fn on_launch(&mut self, state: &mut SyncState) -> Vec<LifecycleAction> {
        state.lifecycle_phase = LifecyclePhase::Background;
        if self.config.start_location_on_launch {
            self.location_active = true;
            vec![LifecycleAction::StartLocation {
                cadence_multiplier: self.config.background_factor,
            }]
        } else {
            Vec::new()
        }
    }

    pub fn handle(&mut self, signal: LifecycleSignal, state: &mut SyncState) -> Vec<LifecycleAction> {
        match signal {
            LifecycleSignal::Foreground => self.on_foreground(state),
            LifecycleSignal::Background => self.on_background(state),
            LifecycleSignal::Terminate => self.on_terminate(state),
        }
    }

    pub fn on_foreground(&mut self, state: &mut SyncState) -> Vec<LifecycleAction> {
        if state.lifecycle_phase != LifecyclePhase::Background {
            return Vec::new();
        }
        state.lifecycle_phase = LifecyclePhase::Foreground;
        info!("[LifecycleCoordinator] Foreground");

        let location = if self.location_active {
            LifecycleAction::SetCadence { cadence_multiplier: 1.0 }
        } else {
            self.location_active = true;
            LifecycleAction::StartLocation { cadence_multiplier: 1.0 }
        };
        vec![location, LifecycleAction::RequestSync]
    }

    pub fn on_background(&mut self, state: &mut SyncState) -> Vec<LifecycleAction> {
        if state.lifecycle_phase != LifecyclePhase::Foreground {
            return Vec::new();
        }
        state.lifecycle_phase = LifecyclePhase::Background;
        info!(
            "[LifecycleCoordinator] Background ({:?})",
            self.config.background_policy
        );

        if !self.location_active {
            return Vec::new();
        }
        match self.config.background_policy {
            BackgroundPolicy::ReducedCadence => vec![LifecycleAction::SetCadence {
                cadence_multiplier: self.config.background_factor,
            }],
            BackgroundPolicy::StopUpdates => {
                self.location_active = false;
                vec![LifecycleAction::StopLocation]
            }
        }
    }

    pub fn on_terminate(&mut self, state: &mut SyncState) -> Vec<LifecycleAction> {
        if state.lifecycle_phase == LifecyclePhase::Stopped {
            return Vec::new();
        }
        state.lifecycle_phase = LifecyclePhase::Stopped;
        info!("[LifecycleCoordinator] Terminate");

        let mut actions = Vec::with_capacity(3);
        if self.location_active {
            self.location_active = false;
            actions.push(LifecycleAction::StopLocation);
        }
        actions.push(LifecycleAction::CancelInFlight);
        actions.push(LifecycleAction::Shutdown);
        actions
    }

    pub fn location_active(&self) -> bool {
        self.location_active
    }
}
