//! SQLite schema migrations for the record store.

use log::info;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::Result;

/// Ordered schema history. Append only.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            -- One row per storage key; the record column holds the JSON payload
            CREATE TABLE records (
                key TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                valid_until INTEGER NOT NULL,
                source_request_id INTEGER NOT NULL
            );

            CREATE INDEX idx_records_valid_until ON records(valid_until);

            -- Pipeline metadata that must survive restarts
            CREATE TABLE sync_meta (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        ),
        // Write order, so `latest` does not depend on wall-clock timestamps
        M::up(
            r#"
            ALTER TABLE records ADD COLUMN seq INTEGER NOT NULL DEFAULT 0;
            UPDATE records SET seq = rowid;
            CREATE INDEX idx_records_seq ON records(seq);
            "#,
        ),
    ])
}

/// Bring a connection's schema up to date.
pub fn apply(conn: &mut Connection) -> Result<()> {
    migrations().to_latest(conn)?;
    info!("[SqliteStore] Schema up to date");
    Ok(())
}
