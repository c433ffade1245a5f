//! Durability of the SQLite store across close and reopen.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{fast_config, init_logging, record, TestFetcher};
use geosync::{
    GeoSyncError, PersistedRecord, PushLocationProvider, RecordStore, RequestId, SqliteStore,
    SyncEngine, SyncErrorKind, UNLOCATED_KEY,
};
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> String {
    dir.path().join("records.db").to_string_lossy().into_owned()
}

fn persisted(key: &str, id: &str, request: u64) -> PersistedRecord {
    PersistedRecord {
        key: key.to_string(),
        value: record(id, Utc.with_ymd_and_hms(2035, 6, 1, 0, 0, 0).unwrap()),
        stored_at: Utc::now(),
        source_request_id: RequestId(request),
    }
}

#[test]
fn records_survive_reopen() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let store = SqliteStore::open(&path).unwrap();
    store.put(&persisted("b:1:1", "r1", 1)).unwrap();
    store.put(&persisted("b:2:2", "r2", 2)).unwrap();
    store.close();

    let reopened = SqliteStore::open(&path).unwrap();
    assert_eq!(reopened.len().unwrap(), 2);
    let got = reopened.get("b:1:1").unwrap().unwrap();
    assert_eq!(got.value.id, "r1");
    assert_eq!(got.value.value["temp"], 5);
    assert_eq!(got.source_request_id, RequestId(1));
    assert_eq!(reopened.latest().unwrap().unwrap().key, "b:2:2");
}

#[test]
fn repeated_put_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&db_path(&dir)).unwrap();
    let entry = persisted("b:5:5", "same", 7);

    store.put(&entry).unwrap();
    store.put(&entry).unwrap();

    assert_eq!(store.len().unwrap(), 1);
    let got = store.get("b:5:5").unwrap().unwrap();
    assert_eq!(got.value, entry.value);
    assert_eq!(got.stored_at.timestamp_millis(), entry.stored_at.timestamp_millis());
}

#[test]
fn corrupted_entry_is_isolated() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let store = SqliteStore::open(&path).unwrap();
    store.put(&persisted("good", "r1", 1)).unwrap();
    store.put(&persisted("bad", "r2", 2)).unwrap();
    store.put(&persisted("blob", "r4", 4)).unwrap();
    store.close();

    {
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute("UPDATE records SET record = 'not json' WHERE key = 'bad'", [])
            .unwrap();
        raw.execute("UPDATE records SET record = X'00FF' WHERE key = 'blob'", [])
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let err = store.get("bad").unwrap_err();
    assert_eq!(err.kind(), Some(SyncErrorKind::CorruptedEntry));
    let err = store.get("blob").unwrap_err();
    assert_eq!(err.kind(), Some(SyncErrorKind::CorruptedEntry));
    assert_eq!(store.get("good").unwrap().unwrap().value.id, "r1");
    // The two newest rows are unreadable, so latest falls back to the oldest
    assert_eq!(store.latest().unwrap().unwrap().key, "good");
    // Overwriting repairs the entry
    store.put(&persisted("bad", "r3", 3)).unwrap();
    assert_eq!(store.get("bad").unwrap().unwrap().value.id, "r3");
}

#[test]
fn closed_store_reports_closed() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&db_path(&dir)).unwrap();
    store.close();
    assert!(matches!(store.len(), Err(GeoSyncError::StoreClosed)));
    assert!(matches!(store.get_meta("x"), Err(GeoSyncError::StoreClosed)));
}

#[tokio::test]
async fn engine_state_survives_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::new(PushLocationProvider::new()),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();
    handle.request_sync().unwrap();
    let status = handle
        .wait_until(|s| s.stats.succeeded == 1, Duration::from_secs(5))
        .await
        .expect("sync did not complete");
    let synced_at = status.last_successful_sync_at.unwrap();
    handle.terminate().await;
    assert!(matches!(store.len(), Err(GeoSyncError::StoreClosed)));

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let stored = store.get(UNLOCATED_KEY).unwrap().expect("record persisted");
    assert_eq!(stored.value.id, format!("rec-{}", stored.source_request_id.0));

    let handle = SyncEngine::spawn(
        fast_config(),
        Arc::new(PushLocationProvider::new()),
        TestFetcher::new(),
        Arc::clone(&store),
    )
    .unwrap();
    let reloaded = handle.status().last_successful_sync_at.unwrap();
    assert_eq!(reloaded.timestamp_millis(), synced_at.timestamp_millis());
    handle.terminate().await;
}
