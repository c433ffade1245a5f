//! Coordination context.
//!
//! The engine is a single task that owns [`SyncState`], the
//! [`SyncScheduler`] and the [`LifecycleCoordinator`]. Everything that can
//! change that state arrives as an input to its loop:
//!
//! - commands from [`SyncEngineHandle`]s (manual sync, lifecycle signals)
//! - location events through the bounded [`SampleQueue`]
//! - timer ticks
//! - fetch and persistence completions reported by the tasks it spawned
//!
//! Inputs are processed in batches: after the first input wakes the loop,
//! every input already queued is processed before the pending request is
//! dispatched. Simultaneous triggers therefore meet in the scheduler and are
//! resolved by its replacement rules.
//!
//! Fetches run on their own task and persistence on the blocking pool, so the
//! loop never waits on I/O except when shutting down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::{StoreConfig, SyncConfig};
use crate::error::{GeoSyncError, Result, SyncErrorKind};
use crate::http::RecordFetcher;
use crate::lifecycle::{LifecycleAction, LifecycleCoordinator, LifecycleSignal};
use crate::location::{
    LocationCallback, LocationEvent, LocationHistory, LocationProvider, LocationSource, SampleQueue,
};
use crate::persistence::{load_last_success, save_last_success, RecordStore};
use crate::scheduler::{SchedulerPhase, SchedulerStats, SyncScheduler};
use crate::types::{
    bucket_key, FetchResult, LifecyclePhase, LocationSample, PersistedRecord, RequestId, SyncOutcome, SyncState,
    TriggerReason,
};

/// UI-facing snapshot of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// False once the engine has shut down.
    pub running: bool,
    pub phase: LifecyclePhase,
    pub scheduler_phase: SchedulerPhase,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// Most recent error from any component; cleared by a successful sync.
    pub last_error: Option<SyncErrorKind>,
    pub in_flight_request_id: Option<RequestId>,
    pub last_outcome: Option<SyncOutcome>,
    pub latest_sample: Option<LocationSample>,
    pub location_active: bool,
    /// A manual sync is waiting for a one-shot location fix.
    pub awaiting_location_fix: bool,
    /// Location events discarded by the sample queue's backpressure policy.
    pub dropped_location_events: u64,
    pub stats: SchedulerStats,
}

impl SyncStatus {
    fn initial(last_successful_sync_at: Option<DateTime<Utc>>) -> Self {
        Self {
            running: true,
            phase: LifecyclePhase::Background,
            scheduler_phase: SchedulerPhase::Idle,
            last_successful_sync_at,
            last_error: None,
            in_flight_request_id: None,
            last_outcome: None,
            latest_sample: None,
            location_active: false,
            awaiting_location_fix: false,
            dropped_location_events: 0,
            stats: SchedulerStats::default(),
        }
    }
}

/// Requests from handles.
#[derive(Debug, Clone, Copy)]
enum Command {
    RequestSync,
    Lifecycle(LifecycleSignal),
}

/// Completions from spawned work.
#[derive(Debug)]
enum Completion {
    /// One-shot fix requested for a manual sync.
    Located(std::result::Result<LocationSample, SyncErrorKind>),
    Fetched(FetchResult),
    Persisted {
        request_id: RequestId,
        trigger: TriggerReason,
        result: std::result::Result<(String, DateTime<Utc>), SyncErrorKind>,
    },
}

enum Input {
    Command(Command),
    Completion(Completion),
    Location(LocationEvent),
    Tick,
}

/// Decrements the active fetch count when the fetch ends or is aborted.
struct ActiveFetch(Arc<AtomicU64>);

impl Drop for ActiveFetch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running engine. Dropping every handle stops the
/// engine as if it had been terminated.
#[derive(Clone)]
pub struct SyncEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    history: Arc<LocationHistory>,
    accept_missing_accuracy: bool,
    bucket_size_deg: f64,
}

impl SyncEngineHandle {
    fn send(&self, command: Command) -> Result<()> {
        if !self.status.borrow().running {
            return Err(GeoSyncError::EngineStopped);
        }
        self.commands.send(command).map_err(|_| GeoSyncError::EngineStopped)
    }

    /// Issue a Manual sync trigger.
    pub fn request_sync(&self) -> Result<()> {
        self.send(Command::RequestSync)
    }

    pub fn on_foreground(&self) -> Result<()> {
        self.send(Command::Lifecycle(LifecycleSignal::Foreground))
    }

    pub fn on_background(&self) -> Result<()> {
        self.send(Command::Lifecycle(LifecycleSignal::Background))
    }

    /// Stop the pipeline. Resolves once location is stopped, in-flight work
    /// is cancelled and the store is closed.
    pub async fn terminate(&self) {
        let _ = self.commands.send(Command::Lifecycle(LifecycleSignal::Terminate));
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| !s.running).await;
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`, or `timeout` elapses.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Option<SyncStatus>
    where
        F: FnMut(&SyncStatus) -> bool,
    {
        let mut status = self.status.clone();
        if let Ok(Ok(current)) = tokio::time::timeout(timeout, status.wait_for(predicate)).await {
            return Some(current.clone());
        }
        None
    }

    /// Newest emitted location sample within the age and accuracy limits.
    pub fn latest_valid_location(
        &self,
        max_age: Option<Duration>,
        min_accuracy_meters: Option<f64>,
    ) -> Option<LocationSample> {
        self.history
            .latest_valid(Utc::now(), max_age, min_accuracy_meters, self.accept_missing_accuracy)
    }

    /// Store key a result fetched at this coordinate is written under.
    pub fn record_key_for(&self, latitude: f64, longitude: f64) -> String {
        bucket_key(latitude, longitude, self.bucket_size_deg)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The sync pipeline's coordination context.
pub struct SyncEngine<P: LocationProvider, F: RecordFetcher, S: RecordStore> {
    state: SyncState,
    scheduler: SyncScheduler,
    lifecycle: LifecycleCoordinator,
    location: LocationSource<P>,
    fetcher: Arc<F>,
    store: Arc<S>,
    store_config: StoreConfig,
    queue: Arc<SampleQueue>,
    completions: mpsc::UnboundedSender<Completion>,
    fetch_task: Option<JoinHandle<()>>,
    persist_task: Option<JoinHandle<()>>,
    one_shot_task: Option<JoinHandle<()>>,
    one_shot_timeout: Option<Duration>,
    fresh_fix_max_age: Duration,
    active_fetches: Arc<AtomicU64>,
    last_error: Option<SyncErrorKind>,
    last_outcome: Option<SyncOutcome>,
    status: watch::Sender<SyncStatus>,
    stopped: bool,
}

impl<P: LocationProvider, F: RecordFetcher, S: RecordStore> SyncEngine<P, F, S> {
    /// Start the pipeline on the current tokio runtime.
    ///
    /// Purges expired records (if configured), reloads the last successful
    /// sync time, applies the launch lifecycle actions and spawns the loop.
    pub fn spawn(config: SyncConfig, provider: Arc<P>, fetcher: F, store: Arc<S>) -> Result<SyncEngineHandle> {
        config.validate()?;

        if config.store.purge_expired_on_start {
            store.purge_expired(Utc::now())?;
        }
        let last_success = load_last_success(store.as_ref())?;

        let mut state = SyncState::new(LifecyclePhase::Background);
        state.last_successful_sync_at = last_success;

        let queue = Arc::new(SampleQueue::new(
            config.location.queue_capacity,
            config.location.backpressure,
        ));
        let location = LocationSource::new(provider, config.location.clone());
        let history = location.history();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::initial(last_success));

        let timer = config.scheduler.timer_interval().map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        let mut engine = SyncEngine {
            state,
            scheduler: SyncScheduler::new(config.scheduler.clone()),
            lifecycle: LifecycleCoordinator::new(config.lifecycle.clone()),
            location,
            fetcher: Arc::new(fetcher),
            store,
            store_config: config.store.clone(),
            queue,
            completions: completion_tx,
            fetch_task: None,
            persist_task: None,
            one_shot_task: None,
            one_shot_timeout: config.location.one_shot_timeout(),
            fresh_fix_max_age: config.location.fresh_fix_max_age(),
            active_fetches: Arc::new(AtomicU64::new(0)),
            last_error: None,
            last_outcome: None,
            status: status_tx,
            stopped: false,
        };

        let launch = engine.lifecycle.on_launch(&mut engine.state);
        for action in launch {
            engine.apply_immediate(action);
        }
        engine.publish();

        info!(
            "[SyncEngine] Started (last success: {:?}, timer: {:?})",
            last_success,
            config.scheduler.timer_interval()
        );
        tokio::spawn(engine.run(command_rx, completion_rx, timer));

        Ok(SyncEngineHandle {
            commands: command_tx,
            status: status_rx,
            history,
            accept_missing_accuracy: config.location.accept_missing_accuracy,
            bucket_size_deg: config.store.bucket_size_deg,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut timer: Option<Interval>,
    ) {
        let queue = Arc::clone(&self.queue);

        while !self.stopped {
            let input = tokio::select! {
                command = commands.recv() => Input::Command(
                    command.unwrap_or(Command::Lifecycle(LifecycleSignal::Terminate)),
                ),
                Some(completion) = completions.recv() => Input::Completion(completion),
                event = queue.recv() => Input::Location(event),
                _ = next_tick(&mut timer) => Input::Tick,
            };
            self.process(input).await;

            // Drain everything that arrived together before dispatching
            while !self.stopped {
                match commands.try_recv() {
                    Ok(command) => {
                        self.process(Input::Command(command)).await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => {
                        self.process(Input::Command(Command::Lifecycle(LifecycleSignal::Terminate)))
                            .await;
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                }
                if let Ok(completion) = completions.try_recv() {
                    self.process(Input::Completion(completion)).await;
                    continue;
                }
                if let Some(event) = queue.try_pop() {
                    self.process(Input::Location(event)).await;
                    continue;
                }
                break;
            }

            if !self.stopped {
                self.dispatch_pending();
            }
            self.publish();
        }
        info!("[SyncEngine] Stopped");
    }

    async fn process(&mut self, input: Input) {
        match input {
            Input::Command(Command::RequestSync) => self.request_manual(),
            Input::Command(Command::Lifecycle(signal)) => {
                let actions = self.lifecycle.handle(signal, &mut self.state);
                for action in actions {
                    self.apply(action).await;
                }
            }
            Input::Completion(Completion::Located(fix)) => self.on_located(fix),
            Input::Completion(Completion::Fetched(result)) => self.on_fetched(result),
            Input::Completion(Completion::Persisted {
                request_id,
                trigger,
                result,
            }) => self.on_persisted(request_id, trigger, result),
            Input::Location(LocationEvent::Sample(sample)) => {
                self.trigger(TriggerReason::LocationChange, Some(sample));
            }
            Input::Location(LocationEvent::Error(kind)) => {
                warn!("[SyncEngine] Location error: {}", kind);
                self.last_error = Some(kind);
            }
            Input::Tick => self.trigger(TriggerReason::TimerElapsed, None),
        }
    }

    fn trigger(&mut self, reason: TriggerReason, sample: Option<LocationSample>) {
        if self.stopped {
            return;
        }
        self.scheduler.trigger(&self.state, reason, sample, Utc::now());
    }

    /// Manual trigger. Without a recent sample, a one-shot fix is requested
    /// first and the trigger is issued once it resolves.
    fn request_manual(&mut self) {
        if self.stopped {
            return;
        }
        if self.one_shot_task.is_some() {
            debug!("[SyncEngine] Manual sync already waiting for a fix");
            return;
        }
        let Some(timeout) = self.one_shot_timeout else {
            self.trigger(TriggerReason::Manual, None);
            return;
        };
        if self.location.latest_valid(Some(self.fresh_fix_max_age), None).is_some() {
            self.trigger(TriggerReason::Manual, None);
            return;
        }

        debug!("[SyncEngine] No recent sample, requesting a one-shot fix");
        let fix = self.location.one_shot(timeout);
        let completions = self.completions.clone();
        self.one_shot_task = Some(tokio::spawn(async move {
            let result = fix.await;
            let _ = completions.send(Completion::Located(result));
        }));
    }

    fn on_located(&mut self, fix: std::result::Result<LocationSample, SyncErrorKind>) {
        self.one_shot_task = None;
        match fix {
            Ok(sample) => self.trigger(TriggerReason::Manual, Some(sample)),
            Err(kind) => {
                warn!("[SyncEngine] One-shot fix failed: {}", kind);
                self.last_error = Some(kind);
                self.trigger(TriggerReason::Manual, None);
            }
        }
    }

    /// Actions that never need to wait.
    fn apply_immediate(&mut self, action: LifecycleAction) {
        match action {
            LifecycleAction::StartLocation { cadence_multiplier } => {
                self.location.set_cadence_multiplier(cadence_multiplier);
                let queue = Arc::clone(&self.queue);
                let callback: LocationCallback = Arc::new(move |event| queue.push(event));
                if let Err(e) = self.location.start(callback) {
                    debug!("[SyncEngine] Location start skipped: {}", e);
                }
            }
            LifecycleAction::SetCadence { cadence_multiplier } => {
                self.location.set_cadence_multiplier(cadence_multiplier);
            }
            LifecycleAction::StopLocation => self.location.stop(),
            LifecycleAction::RequestSync => self.request_manual(),
            LifecycleAction::CancelInFlight => {
                if let Some(task) = self.fetch_task.take() {
                    task.abort();
                }
                if let Some(id) = self.scheduler.cancel(&mut self.state) {
                    info!("[SyncEngine] Cancelled in-flight {}", id);
                }
            }
            LifecycleAction::Shutdown => {}
        }
    }

    async fn apply(&mut self, action: LifecycleAction) {
        match action {
            LifecycleAction::Shutdown => self.shutdown().await,
            other => self.apply_immediate(other),
        }
    }

    async fn shutdown(&mut self) {
        self.location.stop();
        if let Some(task) = self.one_shot_task.take() {
            task.abort();
        }
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        // A write already handed to the store finishes before the store closes
        if let Some(task) = self.persist_task.take() {
            let _ = task.await;
        }
        self.store.close();
        self.stopped = true;
    }

    fn dispatch_pending(&mut self) {
        let Some(request) = self.scheduler.dispatch(&mut self.state) else {
            return;
        };

        let active = Arc::clone(&self.active_fetches);
        let running = active.fetch_add(1, Ordering::SeqCst) + 1;
        self.scheduler.record_concurrency(running);
        info!(
            "[SyncEngine] Dispatching {} ({:?})",
            request.id, request.trigger_reason
        );

        let fetcher = Arc::clone(&self.fetcher);
        let completions = self.completions.clone();
        let guard = ActiveFetch(active);
        self.fetch_task = Some(tokio::spawn(async move {
            let result = fetcher.fetch(request).await;
            drop(guard);
            let _ = completions.send(Completion::Fetched(result));
        }));
    }

    fn on_fetched(&mut self, result: FetchResult) {
        let request_id = result.request.id;
        if !self.scheduler.begin_settle(&self.state, request_id) {
            return;
        }
        self.fetch_task = None;

        let payload = match (result.payload, result.error) {
            (Some(payload), None) => payload,
            (_, error) => {
                let kind = error.unwrap_or(SyncErrorKind::DecodeFailure);
                self.finish(request_id, result.request.trigger_reason, Err(kind));
                return;
            }
        };

        let record = PersistedRecord::from_fetch(&result.request, payload, self.store_config.bucket_size_deg);
        let trigger = result.request.trigger_reason;
        let store = Arc::clone(&self.store);
        let completions = self.completions.clone();
        debug!("[SyncEngine] Persisting {} under {}", request_id, record.key);

        self.persist_task = Some(tokio::spawn(async move {
            let written = tokio::task::spawn_blocking(move || {
                store.put(&record)?;
                let at = Utc::now();
                if let Err(e) = save_last_success(store.as_ref(), at) {
                    warn!("[SyncEngine] Could not persist sync time: {}", e);
                }
                Ok::<_, GeoSyncError>((record.key, at))
            })
            .await;

            let result = match written {
                Ok(Ok(written)) => Ok(written),
                Ok(Err(e)) => Err(e.kind().unwrap_or(SyncErrorKind::StorageFull)),
                Err(e) => {
                    warn!("[SyncEngine] Persist task failed: {}", e);
                    Err(SyncErrorKind::StorageFull)
                }
            };
            let _ = completions.send(Completion::Persisted {
                request_id,
                trigger,
                result,
            });
        }));
    }

    fn on_persisted(
        &mut self,
        request_id: RequestId,
        trigger: TriggerReason,
        result: std::result::Result<(String, DateTime<Utc>), SyncErrorKind>,
    ) {
        if self.state.in_flight_request_id == Some(request_id) {
            self.persist_task = None;
        }
        self.finish(request_id, trigger, result);
    }

    fn finish(
        &mut self,
        request_id: RequestId,
        trigger: TriggerReason,
        result: std::result::Result<(String, DateTime<Utc>), SyncErrorKind>,
    ) {
        let (stored_key, error, at) = match result {
            Ok((key, at)) => (Some(key), None, at),
            Err(kind) => (None, Some(kind), Utc::now()),
        };
        if !self
            .scheduler
            .complete(&mut self.state, request_id, error.is_none(), at)
        {
            return;
        }

        match error {
            None => info!("[SyncEngine] {} synced", request_id),
            Some(kind) => warn!("[SyncEngine] {} failed: {}", request_id, kind),
        }
        self.last_error = error;
        self.last_outcome = Some(SyncOutcome {
            request_id,
            trigger,
            error,
            stored_key,
            completed_at: at,
        });
    }

    fn publish(&self) {
        let status = SyncStatus {
            running: !self.stopped,
            phase: self.state.lifecycle_phase,
            scheduler_phase: self.scheduler.phase(&self.state),
            last_successful_sync_at: self.state.last_successful_sync_at,
            last_error: self.last_error,
            in_flight_request_id: self.state.in_flight_request_id,
            last_outcome: self.last_outcome.clone(),
            latest_sample: self.scheduler.latest_sample(),
            location_active: self.location.is_running(),
            awaiting_location_fix: self.one_shot_task.is_some(),
            dropped_location_events: self.queue.dropped(),
            stats: self.scheduler.stats().clone(),
        };
        self.status.send_replace(status);
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
