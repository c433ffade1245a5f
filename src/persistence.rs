//! Local record store.
//!
//! [`RecordStore`] is the capability the engine writes fetch results into and
//! the UI reads from. At most one record exists per key; `put` replaces it
//! atomically, so readers see either the old or the new record.
//!
//! Two implementations:
//! - [`SqliteStore`]: durable store (WAL journal, `synchronous = FULL`)
//! - [`MemoryStore`]: shared in-process store with fault injection, for tests
//!   and hosts that do not need durability

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{GeoSyncError, Result, SyncErrorKind};
use crate::migrations;
use crate::types::{PersistedRecord, RemoteRecord, RequestId};

/// Metadata key holding the last successful sync time (RFC 3339).
pub const META_LAST_SUCCESS: &str = "last_successful_sync_at";

/// Key-value record storage.
pub trait RecordStore: Send + Sync + 'static {
    /// Insert or replace the record under `record.key`.
    fn put(&self, record: &PersistedRecord) -> Result<()>;

    /// Record under `key`. A stored entry that cannot be decoded yields
    /// `CorruptedEntry`; other keys are unaffected.
    fn get(&self, key: &str) -> Result<Option<PersistedRecord>>;

    /// Most recently written decodable record.
    fn latest(&self) -> Result<Option<PersistedRecord>>;

    fn get_meta(&self, name: &str) -> Result<Option<String>>;

    fn set_meta(&self, name: &str, value: &str) -> Result<()>;

    /// Remove records whose `valid_until` is before `now`. Returns the count removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    /// Release the underlying resources. Later calls fail with `StoreClosed`.
    fn close(&self);
}

/// Read the persisted last-success timestamp.
pub fn load_last_success<S: RecordStore + ?Sized>(store: &S) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = store.get_meta(META_LAST_SUCCESS)? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
        Err(e) => {
            warn!("[RecordStore] Ignoring unreadable {}: {}", META_LAST_SUCCESS, e);
            Ok(None)
        }
    }
}

/// Persist the last-success timestamp.
pub fn save_last_success<S: RecordStore + ?Sized>(store: &S, at: DateTime<Utc>) -> Result<()> {
    store.set_meta(META_LAST_SUCCESS, &at.to_rfc3339())
}

// ============================================================================
// SQLite
// ============================================================================

/// Durable SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and migrate it.
    pub fn open(db_path: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        migrations::apply(&mut conn)?;
        info!("[SqliteStore] Opened {} (journal_mode={})", db_path, mode);

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let guard = self.conn.lock().map_err(|_| GeoSyncError::Storage {
            message: "connection lock poisoned".to_string(),
        })?;
        let conn = guard.as_ref().ok_or(GeoSyncError::StoreClosed)?;
        f(conn)
    }
}

fn decode_row(
    key: &str,
    record: &str,
    stored_at_ms: i64,
    source_request_id: i64,
) -> std::result::Result<PersistedRecord, SyncErrorKind> {
    let value: RemoteRecord = serde_json::from_str(record).map_err(|e| {
        warn!("[SqliteStore] Corrupted entry {}: {}", key, e);
        SyncErrorKind::CorruptedEntry
    })?;
    let stored_at = DateTime::from_timestamp_millis(stored_at_ms).ok_or(SyncErrorKind::CorruptedEntry)?;
    Ok(PersistedRecord {
        key: key.to_string(),
        value,
        stored_at,
        source_request_id: RequestId(source_request_id as u64),
    })
}

impl RecordStore for SqliteStore {
    fn put(&self, record: &PersistedRecord) -> Result<()> {
        let json = serde_json::to_string(&record.value).map_err(|e| GeoSyncError::Storage {
            message: format!("failed to encode record: {}", e),
        })?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (key, record, stored_at, valid_until, source_request_id, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM records))
                 ON CONFLICT(key) DO UPDATE SET
                    record = excluded.record,
                    stored_at = excluded.stored_at,
                    valid_until = excluded.valid_until,
                    source_request_id = excluded.source_request_id,
                    seq = excluded.seq",
                params![
                    record.key,
                    json,
                    record.stored_at.timestamp_millis(),
                    record.value.valid_until.timestamp(),
                    record.source_request_id.0 as i64,
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Option<PersistedRecord>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT record, stored_at, source_request_id FROM records WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, Value>(0)?, row.get::<_, Value>(1)?, row.get::<_, Value>(2)?)),
                )
                .optional()?)
        })?;

        match row {
            None => Ok(None),
            Some((Value::Text(record), Value::Integer(stored_at), Value::Integer(source))) => {
                Ok(Some(decode_row(key, &record, stored_at, source)?))
            }
            Some(_) => {
                warn!("[SqliteStore] Corrupted entry {}: unexpected column types", key);
                Err(SyncErrorKind::CorruptedEntry.into())
            }
        }
    }

    fn latest(&self) -> Result<Option<PersistedRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, record, stored_at, source_request_id FROM records ORDER BY seq DESC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                // Undecodable rows (including wrongly typed columns) are skipped
                let (Value::Text(record), Value::Integer(stored_at), Value::Integer(source)) =
                    (row.get::<_, Value>(1)?, row.get::<_, Value>(2)?, row.get::<_, Value>(3)?)
                else {
                    warn!("[SqliteStore] Skipping unreadable entry {}", key);
                    continue;
                };
                if let Ok(decoded) = decode_row(&key, &record, stored_at, source) {
                    return Ok(Some(decoded));
                }
            }
            Ok(None)
        })
    }

    fn get_meta(&self, name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn set_meta(&self, name: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_meta (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )?;
            Ok(())
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM records WHERE valid_until < ?1",
                params![now.timestamp()],
            )?)
        })?;
        if removed > 0 {
            info!("[SqliteStore] Purged {} expired records", removed);
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn close(&self) {
        let Ok(mut guard) = self.conn.lock() else {
            return;
        };
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!("[SqliteStore] Close failed: {}", e);
            } else {
                info!("[SqliteStore] Closed {}", self.db_path);
            }
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// A stored value and its write sequence number, or an undecodable entry.
#[derive(Clone)]
enum MemoryEntry {
    Valid(PersistedRecord, u64),
    Corrupted,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, MemoryEntry>,
    meta: HashMap<String, String>,
    next_seq: u64,
    closed: bool,
    fail_puts: Option<SyncErrorKind>,
    put_delay: Option<Duration>,
    puts: u64,
}

/// In-process store. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| GeoSyncError::Storage {
            message: "memory store lock poisoned".to_string(),
        })
    }

    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        let state = self.lock()?;
        if state.closed {
            return Err(GeoSyncError::StoreClosed);
        }
        Ok(state)
    }

    /// Make every following `put` fail with `kind` (None clears the fault).
    pub fn fail_puts_with(&self, kind: Option<SyncErrorKind>) {
        if let Ok(mut state) = self.lock() {
            state.fail_puts = kind;
        }
    }

    /// Block each `put` for `delay` before writing.
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.lock() {
            state.put_delay = delay;
        }
    }

    /// Mark the entry under `key` as undecodable.
    pub fn corrupt(&self, key: &str) {
        if let Ok(mut state) = self.lock() {
            state.records.insert(key.to_string(), MemoryEntry::Corrupted);
        }
    }

    /// Number of successful writes.
    pub fn put_count(&self) -> u64 {
        self.lock().map(|s| s.puts).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, record: &PersistedRecord) -> Result<()> {
        let delay = self.open_state()?.put_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.open_state()?;
        if let Some(kind) = state.fail_puts {
            return Err(GeoSyncError::Sync(kind));
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state
            .records
            .insert(record.key.clone(), MemoryEntry::Valid(record.clone(), seq));
        state.puts += 1;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<PersistedRecord>> {
        match self.open_state()?.records.get(key) {
            None => Ok(None),
            Some(MemoryEntry::Valid(record, _)) => Ok(Some(record.clone())),
            Some(MemoryEntry::Corrupted) => Err(SyncErrorKind::CorruptedEntry.into()),
        }
    }

    fn latest(&self) -> Result<Option<PersistedRecord>> {
        let state = self.open_state()?;
        Ok(state
            .records
            .values()
            .filter_map(|entry| match entry {
                MemoryEntry::Valid(record, seq) => Some((record, *seq)),
                MemoryEntry::Corrupted => None,
            })
            .max_by_key(|(_, seq)| *seq)
            .map(|(record, _)| record.clone()))
    }

    fn get_meta(&self, name: &str) -> Result<Option<String>> {
        Ok(self.open_state()?.meta.get(name).cloned())
    }

    fn set_meta(&self, name: &str, value: &str) -> Result<()> {
        self.open_state()?.meta.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.open_state()?;
        let before = state.records.len();
        state.records.retain(|_, entry| match entry {
            MemoryEntry::Valid(record, _) => record.value.valid_until >= now,
            MemoryEntry::Corrupted => true,
        });
        Ok(before - state.records.len())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.open_state()?.records.len())
    }

    fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(key: &str, id: &str, request: u64) -> PersistedRecord {
        PersistedRecord {
            key: key.to_string(),
            value: RemoteRecord {
                id: id.to_string(),
                value: serde_json::json!({"level": request}),
                valid_until: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            },
            stored_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            source_request_id: RequestId(request),
        }
    }

    fn exercise_put_get(store: &dyn RecordStore) {
        assert_eq!(store.get("b:1:1").unwrap(), None);
        store.put(&record("b:1:1", "r1", 1)).unwrap();
        store.put(&record("b:1:1", "r2", 2)).unwrap();
        let got = store.get("b:1:1").unwrap().unwrap();
        assert_eq!(got.value.id, "r2");
        assert_eq!(got.source_request_id, RequestId(2));
        assert_eq!(got.stored_at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_put_replaces() {
        exercise_put_get(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_memory_put_replaces() {
        exercise_put_get(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_latest_follows_write_order() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(&record("a", "r1", 1)).unwrap();
        store.put(&record("b", "r2", 2)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().key, "b");
        store.put(&record("a", "r3", 3)).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().key, "a");
    }

    #[test]
    fn test_sqlite_meta_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(load_last_success(&store).unwrap(), None);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        save_last_success(&store, at).unwrap();
        assert_eq!(load_last_success(&store).unwrap(), Some(at));
    }

    #[test]
    fn test_purge_expired() {
        let store = SqliteStore::in_memory().unwrap();
        let mut stale = record("old", "r1", 1);
        stale.value.valid_until = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.put(&stale).unwrap();
        store.put(&record("fresh", "r2", 2)).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = SqliteStore::in_memory().unwrap();
        store.close();
        assert!(matches!(store.get("a"), Err(GeoSyncError::StoreClosed)));
        assert_eq!(
            store.put(&record("a", "r1", 1)).unwrap_err().kind(),
            Some(SyncErrorKind::StorageFull)
        );
        // Closing twice is harmless
        store.close();
    }

    #[test]
    fn test_memory_faults() {
        let store = MemoryStore::new();
        store.put(&record("a", "r1", 1)).unwrap();
        store.put(&record("b", "r2", 2)).unwrap();
        store.corrupt("b");
        assert_eq!(
            store.get("b").unwrap_err().kind(),
            Some(SyncErrorKind::CorruptedEntry)
        );
        assert_eq!(store.get("a").unwrap().unwrap().value.id, "r1");
        assert_eq!(store.latest().unwrap().unwrap().key, "a");

        store.fail_puts_with(Some(SyncErrorKind::StorageFull));
        assert_eq!(
            store.put(&record("c", "r3", 3)).unwrap_err().kind(),
            Some(SyncErrorKind::StorageFull)
        );
        assert_eq!(store.put_count(), 2);
    }
}
