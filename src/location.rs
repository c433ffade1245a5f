//! Location sampling.
//!
//! [`LocationSource`] wraps a platform [`LocationProvider`] and turns its raw
//! fix stream into filtered [`LocationSample`]s delivered to a callback.
//! Sampling runs on its own task and never waits on network or storage.
//!
//! Transient provider failures are retried with jittered exponential backoff.
//! Once failures have lasted longer than the configured retry window,
//! `ProviderUnavailable` is reported a single time and retries continue at the
//! capped delay. A delivered sample clears the outage.
//!
//! Besides the subscription, a provider answers one-shot requests for a
//! single current fix; [`LocationSource::one_shot`] bounds them with a
//! timeout and records the fix in the history.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{BackpressurePolicy, DesiredAccuracy, LocationConfig};
use crate::error::{GeoSyncError, Result, SyncErrorKind};
use crate::retry::ExponentialBackoff;
use crate::types::LocationSample;

// ============================================================================
// Provider capability
// ============================================================================

/// Failure reported by a platform provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFault {
    /// Permission missing. Reported to the pipeline, then retried slowly.
    PermissionDenied,
    /// No fix within the provider's own timeout. Reported, subscription kept.
    Timeout,
    /// Provider hiccup. Retried silently with backoff.
    Transient(String),
}

/// Item of a provider subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Sample(LocationSample),
    Fault(ProviderFault),
}

/// Request handed to the provider on subscribe.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRequest {
    pub accuracy: DesiredAccuracy,
    /// Desired interval between fixes (already scaled by the cadence multiplier).
    pub interval: Duration,
    pub min_displacement_meters: f64,
}

/// Platform location capability.
///
/// `subscribe` acquires the platform handle and returns the fix stream;
/// `unsubscribe` releases it. A closed stream counts as a transient fault.
/// `request_one_shot` asks for a single current fix whether or not a
/// subscription is live.
pub trait LocationProvider: Send + Sync + 'static {
    fn subscribe(
        &self,
        request: &LocationRequest,
    ) -> std::result::Result<mpsc::Receiver<ProviderEvent>, ProviderFault>;

    fn unsubscribe(&self);

    fn request_one_shot(
        &self,
        request: &LocationRequest,
    ) -> impl Future<Output = std::result::Result<LocationSample, ProviderFault>> + Send;
}

/// Channel capacity between a pushed provider and its subscriber.
const PUSH_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct PushState {
    sender: Option<mpsc::Sender<ProviderEvent>>,
    request: Option<LocationRequest>,
    permission_denied: bool,
    disabled: bool,
    subscribe_calls: u32,
    one_shot_waiters: Vec<oneshot::Sender<LocationSample>>,
    one_shot_request: Option<LocationRequest>,
}

impl PushState {
    fn has_one_shot_waiters(&mut self) -> bool {
        self.one_shot_waiters.retain(|waiter| !waiter.is_closed());
        if self.one_shot_waiters.is_empty() {
            self.one_shot_request = None;
        }
        !self.one_shot_waiters.is_empty()
    }
}

/// Provider fed by the host shell.
///
/// The host watches [`PushLocationProvider::current_request`] to know whether,
/// and how often, the platform should deliver fixes, and forwards each fix
/// with [`PushLocationProvider::push_sample`]. While
/// [`PushLocationProvider::pending_one_shot`] is set the host should obtain a
/// single current fix and push it; the pushed fix answers every waiting
/// one-shot request.
#[derive(Clone, Default)]
pub struct PushLocationProvider {
    state: Arc<Mutex<PushState>>,
}

impl PushLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a fix to the one-shot waiters and the subscription. Returns
    /// false when nobody took it.
    pub fn push_sample(&self, sample: LocationSample) -> bool {
        let answered = match self.state.lock() {
            Ok(mut state) => {
                let waiters = std::mem::take(&mut state.one_shot_waiters);
                state.one_shot_request = None;
                waiters
                    .into_iter()
                    .fold(false, |answered, waiter| waiter.send(sample).is_ok() || answered)
            }
            Err(_) => false,
        };
        self.push(ProviderEvent::Sample(sample)) || answered
    }

    /// Forward a provider fault.
    pub fn push_fault(&self, fault: ProviderFault) -> bool {
        self.push(ProviderEvent::Fault(fault))
    }

    fn push(&self, event: ProviderEvent) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match &state.sender {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Request of the live subscription, if any.
    pub fn current_request(&self) -> Option<LocationRequest> {
        self.state.lock().ok().and_then(|s| s.request.clone())
    }

    pub fn is_subscribed(&self) -> bool {
        self.current_request().is_some()
    }

    /// Make subsequent subscribe calls fail with PermissionDenied.
    pub fn set_permission_denied(&self, denied: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.permission_denied = denied;
        }
    }

    /// Make subsequent subscribe calls fail transiently (provider switched off).
    pub fn set_disabled(&self, disabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.disabled = disabled;
        }
    }

    /// Drop the live stream as a platform hiccup would.
    pub fn interrupt(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.sender = None;
        }
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state.lock().map(|s| s.subscribe_calls).unwrap_or(0)
    }

    /// Request of an unanswered one-shot fix, if any.
    pub fn pending_one_shot(&self) -> Option<LocationRequest> {
        let mut state = self.state.lock().ok()?;
        if state.has_one_shot_waiters() {
            state.one_shot_request.clone()
        } else {
            None
        }
    }
}

impl LocationProvider for PushLocationProvider {
    fn subscribe(
        &self,
        request: &LocationRequest,
    ) -> std::result::Result<mpsc::Receiver<ProviderEvent>, ProviderFault> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProviderFault::Transient("provider state poisoned".to_string()))?;
        state.subscribe_calls += 1;
        if state.permission_denied {
            return Err(ProviderFault::PermissionDenied);
        }
        if state.disabled {
            return Err(ProviderFault::Transient("provider disabled".to_string()));
        }
        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        state.sender = Some(tx);
        state.request = Some(request.clone());
        Ok(rx)
    }

    fn unsubscribe(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.sender = None;
            state.request = None;
        }
    }

    async fn request_one_shot(
        &self,
        request: &LocationRequest,
    ) -> std::result::Result<LocationSample, ProviderFault> {
        let waiter = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ProviderFault::Transient("provider state poisoned".to_string()))?;
            if state.permission_denied {
                return Err(ProviderFault::PermissionDenied);
            }
            if state.disabled {
                return Err(ProviderFault::Transient("provider disabled".to_string()));
            }
            let (tx, rx) = oneshot::channel();
            state.one_shot_waiters.push(tx);
            state.one_shot_request = Some(request.clone());
            rx
        };
        waiter
            .await
            .map_err(|_| ProviderFault::Transient("one-shot request dropped".to_string()))
    }
}

// ============================================================================
// Delivery to the coordination context
// ============================================================================

/// What the location source delivers: a sample, or an error from the taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Sample(LocationSample),
    Error(SyncErrorKind),
}

/// Callback invoked for every emitted event.
pub type LocationCallback = Arc<dyn Fn(LocationEvent) + Send + Sync>;

/// Bounded hand-off queue between the location task and the coordinator.
pub struct SampleQueue {
    items: Mutex<VecDeque<LocationEvent>>,
    notify: Notify,
    capacity: usize,
    policy: BackpressurePolicy,
    dropped: AtomicU64,
}

impl SampleQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, applying the backpressure policy when full.
    pub fn push(&self, event: LocationEvent) {
        let Ok(mut items) = self.items.lock() else {
            return;
        };
        if items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                BackpressurePolicy::DropOldest => {
                    items.pop_front();
                }
                BackpressurePolicy::DropLatest => return,
            }
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<LocationEvent> {
        self.items.lock().ok().and_then(|mut items| items.pop_front())
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> LocationEvent {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded by the backpressure policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// History
// ============================================================================

/// Fixed-capacity ring buffer of emitted samples.
pub struct LocationHistory {
    samples: Mutex<VecDeque<LocationSample>>,
    capacity: AtomicUsize,
}

impl LocationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
        }
    }

    pub fn push(&self, sample: LocationSample) {
        let capacity = self.capacity();
        if let Ok(mut samples) = self.samples.lock() {
            while samples.len() >= capacity {
                samples.pop_front();
            }
            samples.push_back(sample);
        }
    }

    /// Copy of the buffer, newest first.
    pub fn snapshot_newest_first(&self) -> Vec<LocationSample> {
        self.samples
            .lock()
            .map(|samples| samples.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<LocationSample> {
        self.samples.lock().ok().and_then(|s| s.back().copied())
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Change capacity at runtime, evicting the oldest samples if needed.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.capacity.store(capacity, Ordering::Relaxed);
        if let Ok(mut samples) = self.samples.lock() {
            while samples.len() > capacity {
                samples.pop_front();
            }
        }
    }

    /// Newest sample no older than `max_age` and at least as accurate as
    /// `min_accuracy_meters`.
    ///
    /// Samples with unknown accuracy pass the accuracy filter only when
    /// `accept_missing_accuracy` is set.
    pub fn latest_valid(
        &self,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
        min_accuracy_meters: Option<f64>,
        accept_missing_accuracy: bool,
    ) -> Option<LocationSample> {
        self.snapshot_newest_first().into_iter().find(|sample| {
            if let Some(max_age) = max_age {
                let age = (now - sample.captured_at).to_std().unwrap_or(Duration::ZERO);
                if age > max_age {
                    return false;
                }
            }
            match (min_accuracy_meters, sample.accuracy()) {
                (None, _) => true,
                (Some(limit), Some(accuracy)) => accuracy <= limit,
                (Some(_), None) => accept_missing_accuracy,
            }
        })
    }
}

// ============================================================================
// Filtering and retry state
// ============================================================================

/// Drops samples that arrive too soon or too close to the last emitted one.
struct SampleFilter {
    min_interval: Duration,
    min_displacement_meters: f64,
    last: Option<LocationSample>,
}

impl SampleFilter {
    fn new(min_interval: Duration, min_displacement_meters: f64) -> Self {
        Self {
            min_interval,
            min_displacement_meters,
            last: None,
        }
    }

    fn accept(&mut self, sample: &LocationSample) -> bool {
        if !sample.is_valid() {
            return false;
        }
        if let Some(last) = &self.last {
            let Ok(elapsed) = (sample.captured_at - last.captured_at).to_std() else {
                // Older than the last emitted sample
                return false;
            };
            if elapsed < self.min_interval {
                return false;
            }
            if sample.distance_to(last) < self.min_displacement_meters {
                return false;
            }
        }
        self.last = Some(*sample);
        true
    }
}

/// Outage bookkeeping for provider retries.
struct RetryState {
    backoff: ExponentialBackoff,
    rng: StdRng,
    window: Duration,
    outage_since: Option<Instant>,
    unavailable_reported: bool,
    permission_reported: bool,
}

impl RetryState {
    fn new(config: &LocationConfig, rng: StdRng) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_cap_ms),
                config.retry_jitter,
            ),
            rng,
            window: config.max_retry_window(),
            outage_since: None,
            unavailable_reported: false,
            permission_reported: false,
        }
    }

    fn on_sample(&mut self) {
        self.backoff.reset();
        self.outage_since = None;
        self.unavailable_reported = false;
        self.permission_reported = false;
    }

    /// Returns the error to report, if any, and the delay before resubscribing.
    fn on_fault(&mut self, fault: &ProviderFault, now: Instant) -> (Option<SyncErrorKind>, Duration) {
        match fault {
            ProviderFault::PermissionDenied => {
                let report = (!self.permission_reported).then_some(SyncErrorKind::PermissionDenied);
                self.permission_reported = true;
                (report, self.backoff.capped_delay(&mut self.rng))
            }
            ProviderFault::Timeout => (Some(SyncErrorKind::Timeout), self.next_transient_delay()),
            ProviderFault::Transient(_) => {
                let since = *self.outage_since.get_or_insert(now);
                let mut report = None;
                if !self.unavailable_reported && now.duration_since(since) >= self.window {
                    self.unavailable_reported = true;
                    report = Some(SyncErrorKind::ProviderUnavailable);
                }
                (report, self.next_transient_delay())
            }
        }
    }

    fn next_transient_delay(&mut self) -> Duration {
        if self.unavailable_reported {
            self.backoff.capped_delay(&mut self.rng)
        } else {
            self.backoff.next_delay(&mut self.rng)
        }
    }
}

// ============================================================================
// Location Source
// ============================================================================

/// Observes a provider and delivers filtered samples to a callback.
///
/// Restartable: `stop()` then `start()` opens a fresh subscription.
pub struct LocationSource<P: LocationProvider> {
    provider: Arc<P>,
    config: LocationConfig,
    history: Arc<LocationHistory>,
    cadence_multiplier: f64,
    request_tx: Option<watch::Sender<LocationRequest>>,
    task: Option<JoinHandle<()>>,
}

impl<P: LocationProvider> LocationSource<P> {
    pub fn new(provider: Arc<P>, config: LocationConfig) -> Self {
        let history = Arc::new(LocationHistory::new(config.history_size));
        Self {
            provider,
            config,
            history,
            cadence_multiplier: 1.0,
            request_tx: None,
            task: None,
        }
    }

    /// Begin observation. Must be called from within a tokio runtime.
    pub fn start(&mut self, callback: LocationCallback) -> Result<()> {
        if self.is_running() {
            return Err(GeoSyncError::AlreadyRunning);
        }
        let (request_tx, request_rx) = watch::channel(self.current_request());
        let worker = LocationWorker {
            provider: Arc::clone(&self.provider),
            filter: SampleFilter::new(self.current_request().interval, self.config.min_displacement_meters),
            retry: RetryState::new(&self.config, StdRng::from_entropy()),
            history: Arc::clone(&self.history),
            callback,
            requests: request_rx,
        };
        info!(
            "[LocationSource] Starting ({:?}, interval {:?})",
            self.config.desired_accuracy,
            self.current_request().interval
        );
        self.task = Some(tokio::spawn(worker.run()));
        self.request_tx = Some(request_tx);
        Ok(())
    }

    /// End observation and release the provider handle.
    pub fn stop(&mut self) {
        let was_running = self.task.is_some();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.request_tx = None;
        if was_running {
            self.provider.unsubscribe();
            info!("[LocationSource] Stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Scale the sampling interval (1.0 = foreground cadence). Applies to a
    /// running subscription immediately.
    pub fn set_cadence_multiplier(&mut self, multiplier: f64) {
        if (self.cadence_multiplier - multiplier).abs() < f64::EPSILON {
            return;
        }
        self.cadence_multiplier = multiplier;
        if let Some(tx) = &self.request_tx {
            debug!("[LocationSource] Cadence multiplier now {:.1}", multiplier);
            tx.send_replace(self.current_request());
        }
    }

    pub fn cadence_multiplier(&self) -> f64 {
        self.cadence_multiplier
    }

    /// Effective request for the current cadence.
    pub fn current_request(&self) -> LocationRequest {
        LocationRequest {
            accuracy: self.config.desired_accuracy,
            interval: self.config.interval_at(self.cadence_multiplier),
            min_displacement_meters: self.config.min_displacement_meters,
        }
    }

    pub fn history(&self) -> Arc<LocationHistory> {
        Arc::clone(&self.history)
    }

    /// Newest emitted sample matching the age and accuracy limits.
    pub fn latest_valid(&self, max_age: Option<Duration>, min_accuracy_meters: Option<f64>) -> Option<LocationSample> {
        self.history.latest_valid(
            Utc::now(),
            max_age,
            min_accuracy_meters,
            self.config.accept_missing_accuracy,
        )
    }

    /// Future resolving to a single current fix, bounded by `timeout`. A
    /// valid fix is added to the history. Independent of `start`/`stop`.
    pub fn one_shot(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<LocationSample, SyncErrorKind>> + Send + 'static {
        let provider = Arc::clone(&self.provider);
        let history = Arc::clone(&self.history);
        let request = self.current_request();
        async move {
            match tokio::time::timeout(timeout, provider.request_one_shot(&request)).await {
                Err(_) => Err(SyncErrorKind::Timeout),
                Ok(Err(ProviderFault::PermissionDenied)) => Err(SyncErrorKind::PermissionDenied),
                Ok(Err(ProviderFault::Timeout)) => Err(SyncErrorKind::Timeout),
                Ok(Err(ProviderFault::Transient(reason))) => {
                    debug!("[LocationSource] One-shot fix failed: {}", reason);
                    Err(SyncErrorKind::ProviderUnavailable)
                }
                Ok(Ok(sample)) if !sample.is_valid() => Err(SyncErrorKind::ProviderUnavailable),
                Ok(Ok(sample)) => {
                    history.push(sample);
                    Ok(sample)
                }
            }
        }
    }
}

impl<P: LocationProvider> Drop for LocationSource<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a subscription stream stopped being pumped.
enum StreamEnd {
    RequestChanged,
    Fault(ProviderFault),
    Closed,
}

struct LocationWorker<P: LocationProvider> {
    provider: Arc<P>,
    filter: SampleFilter,
    retry: RetryState,
    history: Arc<LocationHistory>,
    callback: LocationCallback,
    requests: watch::Receiver<LocationRequest>,
}

impl<P: LocationProvider> LocationWorker<P> {
    async fn run(mut self) {
        loop {
            let request = self.requests.borrow_and_update().clone();
            self.filter.min_interval = request.interval;

            let fault = match self.provider.subscribe(&request) {
                Ok(mut stream) => {
                    debug!("[LocationSource] Subscribed (interval {:?})", request.interval);
                    let end = self.pump(&mut stream).await;
                    self.provider.unsubscribe();
                    match end {
                        StreamEnd::RequestChanged => continue,
                        StreamEnd::Closed => return,
                        StreamEnd::Fault(fault) => fault,
                    }
                }
                Err(fault) => fault,
            };

            let (report, delay) = self.retry.on_fault(&fault, Instant::now());
            if let Some(kind) = report {
                warn!("[LocationSource] Reporting {} after {:?}", kind, fault);
                (self.callback)(LocationEvent::Error(kind));
            } else {
                debug!("[LocationSource] {:?}, retrying in {:?}", fault, delay);
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.requests.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(&mut self, stream: &mut mpsc::Receiver<ProviderEvent>) -> StreamEnd {
        loop {
            tokio::select! {
                changed = self.requests.changed() => {
                    return if changed.is_ok() { StreamEnd::RequestChanged } else { StreamEnd::Closed };
                }
                event = stream.recv() => match event {
                    None => return StreamEnd::Fault(ProviderFault::Transient("stream closed".to_string())),
                    Some(ProviderEvent::Sample(sample)) => {
                        if self.filter.accept(&sample) {
                            self.retry.on_sample();
                            self.history.push(sample);
                            (self.callback)(LocationEvent::Sample(sample));
                        }
                    }
                    Some(ProviderEvent::Fault(ProviderFault::Timeout)) => {
                        (self.callback)(LocationEvent::Error(SyncErrorKind::Timeout));
                    }
                    Some(ProviderEvent::Fault(fault)) => return StreamEnd::Fault(fault),
                }
            }
        }
    }
}
