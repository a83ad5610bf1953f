//! Durable device state: treatment counters, reset epoch, identity, WiFi
//! credentials and the hardware address.
//!
//! # Schema
//! Single-row tables (`id = 1`): `counters`, `identity`, `wifi`, `hardware`.
//! `PRAGMA user_version` carries the schema version; a database written by a
//! different version is refused rather than reinterpreted.
//!
//! # Counter validity
//! Counters are trusted only when `counters.marker == COUNTER_MARKER`. A
//! missing row or a wrong marker resets counters and epoch to zero and writes
//! the corrected state back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::identity::Identity;
use crate::link::WifiCredentials;
use crate::types::CounterSnapshot;

pub const SCHEMA_VERSION: i64 = 1;
pub const COUNTER_MARKER: i64 = 0x1234;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported state schema version {found} (expected {SCHEMA_VERSION})")]
    SchemaVersion { found: i64 },
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Counters plus the reset epoch; always persisted together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    pub counters: CounterSnapshot,
    pub reset_epoch: u32,
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::InvalidData(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;",
        )?;
        let integrity: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if integrity != "ok" {
            return Err(StoreError::InvalidData(format!("integrity check failed: {integrity}")));
        }

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match version {
            0 => {
                apply_schema(&conn)?;
                conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
                info!(path = %path.display(), "initialized device state store");
            }
            SCHEMA_VERSION => apply_schema(&conn)?,
            found => return Err(StoreError::SchemaVersion { found }),
        }
        Ok(StateStore { conn })
    }

    /// Load counters, self-healing to zero when the validity marker is wrong.
    pub fn load_counters(&mut self) -> Result<CounterState, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT basic, standard, premium, reset_epoch, marker FROM counters WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        if let Some((basic, standard, premium, epoch, marker)) = row {
            if marker == COUNTER_MARKER {
                let state = CounterState {
                    counters: CounterSnapshot {
                        basic: to_u32(basic)?,
                        standard: to_u32(standard)?,
                        premium: to_u32(premium)?,
                    },
                    reset_epoch: to_u32(epoch)?,
                };
                info!(
                    basic = state.counters.basic,
                    standard = state.counters.standard,
                    premium = state.counters.premium,
                    reset_epoch = state.reset_epoch,
                    "counters loaded"
                );
                return Ok(state);
            }
            warn!(marker, "counter validity marker mismatch, reinitializing to zero");
        } else {
            warn!("no stored counters, initializing to zero");
        }

        let state = CounterState::default();
        self.save_counters(&state)?;
        Ok(state)
    }

    /// Persist counters and epoch. The marker is written last, so an
    /// interrupted write reads back as invalid rather than half-updated.
    pub fn save_counters(&mut self, state: &CounterState) -> Result<(), StoreError> {
        let now: DateTime<Utc> = Utc::now();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO counters (id, basic, standard, premium, reset_epoch, marker, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 basic = excluded.basic,
                 standard = excluded.standard,
                 premium = excluded.premium,
                 reset_epoch = excluded.reset_epoch,
                 marker = 0,
                 updated_at = excluded.updated_at",
            params![
                state.counters.basic,
                state.counters.standard,
                state.counters.premium,
                state.reset_epoch,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE counters SET marker = ?1 WHERE id = 1",
            params![COUNTER_MARKER],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The stored identity, if both halves are present.
    pub fn load_identity(&self) -> Result<Option<Identity>, StoreError> {
        let identity = self
            .conn
            .query_row(
                "SELECT device_id, token, assigned FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok(Identity {
                        device_id: row.get(0)?,
                        token: row.get(1)?,
                        assigned: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(identity.filter(Identity::is_complete))
    }

    /// Persist `identity`. Refuses to overwrite with an empty id or token.
    pub fn save_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        if !identity.is_complete() {
            return Err(StoreError::InvalidData(
                "device_id and token must both be non-empty".to_owned(),
            ));
        }
        let now: DateTime<Utc> = Utc::now();
        self.conn.execute(
            "INSERT INTO identity (id, device_id, token, assigned, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 device_id = excluded.device_id,
                 token = excluded.token,
                 assigned = excluded.assigned,
                 updated_at = excluded.updated_at",
            params![identity.device_id, identity.token, identity.assigned, now],
        )?;
        Ok(())
    }

    pub fn load_wifi(&self) -> Result<Option<WifiCredentials>, StoreError> {
        let creds = self
            .conn
            .query_row("SELECT ssid, password FROM wifi WHERE id = 1", [], |row| {
                Ok(WifiCredentials {
                    ssid: row.get(0)?,
                    password: row.get(1)?,
                })
            })
            .optional()?;
        Ok(creds.filter(|c| c.validate().is_ok()))
    }

    pub fn save_wifi(&mut self, creds: &WifiCredentials) -> Result<(), StoreError> {
        creds.validate().map_err(StoreError::InvalidData)?;
        self.conn.execute(
            "INSERT INTO wifi (id, ssid, password) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET ssid = excluded.ssid, password = excluded.password",
            params![creds.ssid, creds.password],
        )?;
        Ok(())
    }

    /// The persisted hardware address, storing `generate()` on first use.
    pub fn load_or_init_mac(&mut self, generate: impl FnOnce() -> String) -> Result<String, StoreError> {
        let existing: Option<String> = self
            .conn
            .query_row("SELECT mac FROM hardware WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        if let Some(mac) = existing.filter(|m| !m.is_empty()) {
            return Ok(mac);
        }
        let mac = generate();
        self.conn.execute(
            "INSERT OR REPLACE INTO hardware (id, mac) VALUES (1, ?1)",
            params![mac],
        )?;
        info!(mac = %mac, "generated hardware address");
        Ok(mac)
    }
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS counters (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            basic       INTEGER NOT NULL,
            standard    INTEGER NOT NULL,
            premium     INTEGER NOT NULL,
            reset_epoch INTEGER NOT NULL,
            marker      INTEGER NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS identity (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            device_id  TEXT NOT NULL,
            token      TEXT NOT NULL,
            assigned   INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS wifi (
            id       INTEGER PRIMARY KEY CHECK (id = 1),
            ssid     TEXT NOT NULL,
            password TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS hardware (
            id  INTEGER PRIMARY KEY CHECK (id = 1),
            mac TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidData(format!("counter out of range: {value}")))
}
