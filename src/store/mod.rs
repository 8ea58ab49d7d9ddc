//! SQLite-backed persistence for devices, readings, dead letters and users.
//!
//! The schema is ensured at boot; decimals and timestamps are persisted as
//! text so every value round-trips exactly. Timestamps use a fixed-width
//! RFC 3339 form (UTC, microseconds, trailing `Z`) which keeps lexicographic
//! ordering equal to chronological ordering for range scans.

mod dead_letters;
mod devices;
mod readings;
mod users;

pub use dead_letters::DeadLetterFilter;
pub use devices::{DeviceDraft, DevicePatch};
pub use readings::{payload_hash, InsertOutcome, NewReading, ReadingSample};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Database handle shared by the ingestion pipeline and the API.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS account_user (
    id            TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL,
    last_login_at TEXT,
    pw_fail_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS device (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    location        TEXT NOT NULL DEFAULT '',
    mac             TEXT NOT NULL UNIQUE,
    broker          TEXT NOT NULL DEFAULT '',
    port            INTEGER NOT NULL DEFAULT 1883,
    pub_topic       TEXT NOT NULL DEFAULT '',
    sub_topic       TEXT NOT NULL DEFAULT '',
    client_id       TEXT NOT NULL DEFAULT '',
    username        TEXT NOT NULL DEFAULT '',
    password        TEXT NOT NULL DEFAULT '',
    status          INTEGER NOT NULL DEFAULT 1,
    collect_enabled INTEGER NOT NULL DEFAULT 0,
    description     TEXT,
    ingress_type    INTEGER NOT NULL DEFAULT 0,
    user_id         TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reading (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id    TEXT NOT NULL,
    mac          TEXT NOT NULL,
    ts           TEXT NOT NULL,
    energy_kwh   TEXT NOT NULL,
    power        TEXT,
    voltage      TEXT,
    current      TEXT,
    key          TEXT,
    payload      TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    ingested_at  TEXT NOT NULL,
    UNIQUE (mac, ts, payload_hash)
);
CREATE INDEX IF NOT EXISTS idx_reading_device_ts ON reading (device_id, ts);

CREATE TABLE IF NOT EXISTS dead_letter (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id      TEXT,
    mac            TEXT,
    raw_payload    TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    occured_at     TEXT NOT NULL,
    retryable      INTEGER NOT NULL DEFAULT 0,
    meta           TEXT
);
CREATE INDEX IF NOT EXISTS idx_dead_letter_mac ON dead_letter (mac);

CREATE TABLE IF NOT EXISTS subscription_checkpoint (
    id               TEXT PRIMARY KEY,
    device_id        TEXT NOT NULL UNIQUE,
    mac              TEXT NOT NULL,
    last_envelope_ts TEXT,
    cursor           TEXT,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoint_mac ON subscription_checkpoint (mac);
"#;

impl Store {
    /// Opens (creating if needed) the database at `path` and ensures the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .with_context(|| format!("invalid database path: {path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database: {path}"))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps every
    /// statement on the same sqlite instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to ensure database schema")?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 (UTC, microseconds, trailing `Z`).
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp column: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("bad decimal column: {raw}"))
}

pub(crate) fn parse_opt_decimal(raw: Option<String>) -> Result<Option<Decimal>> {
    raw.as_deref().map(parse_decimal).transpose()
}
