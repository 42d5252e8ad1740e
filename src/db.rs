//! SQLite store shared by ingest and reconcile.
//!
//! Two relations: `coin` (canonical inventory, unique on its natural key
//! with nulls coalesced to sentinels) and `match` (candidate matches,
//! unique per coin/Numista id pair). Both commands only append or update;
//! nothing here deletes rows.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub fn open(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS coin (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              issuer         TEXT    NOT NULL,
              year           TEXT    NOT NULL,
              denomination   TEXT    NOT NULL,
              catalog_number INTEGER,
              mintmark       TEXT,
              subject        TEXT,
              occurrences    INTEGER NOT NULL DEFAULT 1,
              composition    TEXT,
              weight         REAL,
              diameter       REAL,
              thickness      REAL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_coin_natural_key
              ON coin (issuer, year, denomination,
                       COALESCE(catalog_number, -1),
                       COALESCE(mintmark, ''),
                       COALESCE(subject, ''));

            CREATE TABLE IF NOT EXISTS match (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              coin_id        INTEGER NOT NULL REFERENCES coin(id),
              numista_id     INTEGER NOT NULL,
              verified       INTEGER NOT NULL DEFAULT 0,
              category       TEXT,
              catalog_number INTEGER,
              title          TEXT,
              UNIQUE (coin_id, numista_id)
            );
            ",
        )
        .context("failed to initialize schema")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
    let connection = Connection::open_in_memory()?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    ensure_schema(&connection)?;
    Ok(connection)
}
