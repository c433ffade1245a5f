//! Lifecycle transitions, termination and orphaned results.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_config, init_logging, sample, wait_subscribed, TestFetcher};
use geosync::{
    BackgroundPolicy, GeoSyncError, LifecyclePhase, MemoryStore, ProviderFault, PushLocationProvider,
    RecordStore, SchedulerPhase, SyncEngine, SyncErrorKind, TriggerReason,
};

const WAIT: Duration = Duration::from_secs(5);

fn interval_of(provider: &PushLocationProvider) -> Option<Duration> {
    provider.current_request().map(|r| r.interval)
}

#[tokio::test]
async fn cadence_follows_foreground_and_background() {
    init_logging();
    let mut config = fast_config();
    config.location.min_interval_secs = 2.0;
    let provider = Arc::new(PushLocationProvider::new());
    let fetcher = TestFetcher::new();
    let handle = SyncEngine::spawn(
        config,
        Arc::clone(&provider),
        fetcher.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    // Launch: background phase, reduced cadence
    wait_subscribed(&provider).await;
    assert_eq!(handle.status().phase, LifecyclePhase::Background);
    assert_eq!(interval_of(&provider), Some(Duration::from_secs(8)));

    // Foreground: full cadence and an immediate manual refresh
    handle.on_foreground().unwrap();
    eventually("foreground cadence", || {
        interval_of(&provider) == Some(Duration::from_secs(2))
    })
    .await;
    let status = handle
        .wait_until(|s| s.stats.succeeded == 1, WAIT)
        .await
        .expect("foreground refresh did not run");
    assert_eq!(status.phase, LifecyclePhase::Foreground);
    assert_eq!(fetcher.requests()[0].trigger_reason, TriggerReason::Manual);

    // Duplicate foreground signal does not trigger another refresh
    handle.on_foreground().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetcher.started(), 1);

    handle.on_background().unwrap();
    eventually("background cadence", || {
        interval_of(&provider) == Some(Duration::from_secs(8))
    })
    .await;
    assert_eq!(handle.status().phase, LifecyclePhase::Background);
    assert!(handle.status().location_active);

    handle.terminate().await;
}

#[tokio::test]
async fn stop_updates_policy_releases_location_in_background() {
    init_logging();
    let mut config = fast_config();
    config.lifecycle.background_policy = BackgroundPolicy::StopUpdates;
    config.lifecycle.start_location_on_launch = false;
    let provider = Arc::new(PushLocationProvider::new());
    let handle = SyncEngine::spawn(
        config,
        Arc::clone(&provider),
        TestFetcher::new(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!provider.is_subscribed());

    handle.on_foreground().unwrap();
    wait_subscribed(&provider).await;

    handle.on_background().unwrap();
    eventually("unsubscribe", || !provider.is_subscribed()).await;

    handle.on_foreground().unwrap();
    wait_subscribed(&provider).await;

    handle.terminate().await;
}

#[tokio::test]
async fn terminate_releases_everything() {
    init_logging();
    let provider = Arc::new(PushLocationProvider::new());
    let store = Arc::new(MemoryStore::new());
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::clone(&provider),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();
    wait_subscribed(&provider).await;

    handle.terminate().await;

    let status = handle.status();
    assert!(!status.running);
    assert_eq!(status.phase, LifecyclePhase::Stopped);
    assert!(!provider.is_subscribed());
    assert!(store.is_closed());
    assert!(matches!(handle.on_foreground(), Err(GeoSyncError::EngineStopped)));
    assert!(matches!(handle.request_sync(), Err(GeoSyncError::EngineStopped)));
    // A second terminate returns immediately
    handle.terminate().await;
}

#[tokio::test]
async fn result_arriving_after_stop_is_discarded() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let fetcher = TestFetcher::gated();
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::new(PushLocationProvider::new()),
        fetcher.clone(),
        Arc::clone(&store),
    )
    .unwrap();

    handle.request_sync().unwrap();
    handle
        .wait_until(|s| s.scheduler_phase == SchedulerPhase::InFlight, WAIT)
        .await
        .expect("fetch not dispatched");
    eventually("fetch start", || fetcher.started() == 1).await;

    handle.terminate().await;
    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.put_count(), 0);
    assert_eq!(handle.status().last_successful_sync_at, None);
    assert_eq!(handle.status().in_flight_request_id, None);
}

#[tokio::test]
async fn terminate_waits_for_write_in_progress() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.set_put_delay(Some(Duration::from_millis(200)));
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::new(PushLocationProvider::new()),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();

    handle.request_sync().unwrap();
    handle
        .wait_until(|s| s.scheduler_phase == SchedulerPhase::Settling, WAIT)
        .await
        .expect("persistence did not start");

    handle.terminate().await;
    // The write completed before the store was closed
    assert_eq!(store.put_count(), 1);
    assert!(store.is_closed());
}

#[tokio::test]
async fn dropped_handles_stop_the_pipeline() {
    init_logging();
    let provider = Arc::new(PushLocationProvider::new());
    let store = Arc::new(MemoryStore::new());
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::clone(&provider),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();
    wait_subscribed(&provider).await;

    drop(handle);
    eventually("store closed", || store.is_closed()).await;
    assert!(!provider.is_subscribed());
}

#[tokio::test]
async fn permission_denied_is_surfaced() {
    init_logging();
    let provider = Arc::new(PushLocationProvider::new());
    provider.set_permission_denied(true);
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::clone(&provider),
        TestFetcher::new(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let status = handle
        .wait_until(|s| s.last_error.is_some(), WAIT)
        .await
        .expect("error not surfaced");
    assert_eq!(status.last_error, Some(SyncErrorKind::PermissionDenied));
    assert!(status.running);

    // Once permission is granted, samples flow again
    provider.set_permission_denied(false);
    wait_subscribed(&provider).await;
    provider.push_sample(sample(5.0, 5.0));
    handle
        .wait_until(|s| s.stats.succeeded == 1, WAIT)
        .await
        .expect("sync after permission grant");

    handle.terminate().await;
}

#[tokio::test]
async fn provider_timeout_is_reported_without_stopping() {
    init_logging();
    let provider = Arc::new(PushLocationProvider::new());
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::clone(&provider),
        TestFetcher::new(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    wait_subscribed(&provider).await;

    assert!(provider.push_fault(ProviderFault::Timeout));
    let status = handle
        .wait_until(|s| s.last_error == Some(SyncErrorKind::Timeout), WAIT)
        .await
        .expect("timeout not reported");
    assert!(status.location_active);
    assert!(provider.is_subscribed());

    // The history answers queries for the latest usable fix
    provider.push_sample(sample(1.0, 2.0));
    handle
        .wait_until(|s| s.latest_sample.is_some(), WAIT)
        .await
        .expect("sample not seen");
    let latest = handle
        .latest_valid_location(Some(Duration::from_secs(60)), Some(10.0))
        .unwrap();
    assert_eq!(latest.latitude, 1.0);

    handle.terminate().await;
}

#[tokio::test]
async fn store_rejects_reads_after_terminate() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::new(PushLocationProvider::new()),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();
    handle.request_sync().unwrap();
    handle
        .wait_until(|s| s.stats.succeeded == 1, WAIT)
        .await
        .expect("sync did not complete");
    handle.terminate().await;
    assert!(store.latest().is_err(), "closed store must reject reads");
}
