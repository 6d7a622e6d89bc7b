//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::config::Limits;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database connection poisoned")]
    Poisoned,
}

const DEVICE_COLUMNS: &str = "id, title, notes, country, location, isp, battery, reserve, \
     battery_comment, reserve_comment, public, interval, notify_interval, email, email_count, \
     email_sent, email_vcode, email_errors, email_confirmed, notify_down, notify_up, created, \
     edit_token, view_token, update_token, ip, last_seen, downtime, downtime_uncrossed, \
     version, notified_down";

const EVENT_COLUMNS: &str =
    "id, device_id, started, ended, downtime, old_ip, new_ip, comment, crossed";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Devices ---

    /// Insert a new device and return its ID.
    pub fn insert_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (interval, notify_interval) VALUES (?1, ?2)",
            params![device.interval, device.notify_interval],
        )?;
        device.id = conn.last_insert_rowid();
        write_device(&conn, device)?;
        Ok(device.id)
    }

    /// Persist the owner-editable and heartbeat columns of a device. The
    /// down-alert flag is only written by `record_heartbeat` and
    /// `mark_notified_down`.
    pub fn save_device(&self, device: &Device) -> Result<(), DbError> {
        let conn = self.conn()?;
        write_device(&conn, device)
    }

    /// Get a device by ID.
    pub fn get_device(&self, id: i64) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        select_device(&conn, id)
    }

    /// Resolve a secret token of the given kind to its device.
    pub fn find_by_token(&self, kind: TokenKind, token: &str) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM devices WHERE {} = ?1",
            DEVICE_COLUMNS,
            kind.column()
        );
        Ok(conn.query_row(&sql, params![token], device_from_row).optional()?)
    }

    /// Get a device by ID, but only if it is public.
    pub fn find_public(&self, id: i64) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM devices WHERE id = ?1 AND public = 1",
            DEVICE_COLUMNS
        );
        Ok(conn.query_row(&sql, params![id], device_from_row).optional()?)
    }

    /// Whether any device already holds `token` as its token of `kind`.
    pub fn token_in_use(&self, kind: TokenKind, token: &str) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM devices WHERE {} = ?1", kind.column());
        let count: i64 = conn.query_row(&sql, params![token], |r| r.get(0))?;
        Ok(count > 0)
    }

    /// Replace one token of a device.
    pub fn set_token(&self, id: i64, kind: TokenKind, token: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let sql = format!("UPDATE devices SET {} = ?1 WHERE id = ?2", kind.column());
        conn.execute(&sql, params![token, id])?;
        Ok(())
    }

    /// Public devices, least downtime first.
    pub fn list_public(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM devices WHERE public = 1 ORDER BY downtime ASC, id ASC",
            DEVICE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Total number of devices ever registered.
    pub fn count_devices(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?)
    }

    /// Devices registered from `ip` after `since`.
    pub fn count_registrations_since(&self, ip: &str, since: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE ip = ?1 AND created > ?2",
            params![ip, format_db_time(&since)],
            |r| r.get(0),
        )?)
    }

    /// Remove a device's events and revoke its tokens. The row itself is kept
    /// so IDs are never reused.
    pub fn delete_device(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM events WHERE device_id = ?1", params![id])?;
        tx.execute(
            "UPDATE devices SET edit_token = NULL, view_token = NULL, update_token = NULL,
             email_confirmed = 0, public = 0 WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Heartbeats ---

    /// Store the outcome of one accepted heartbeat atomically.
    ///
    /// Returns the ID of the inserted event, if any.
    pub fn record_heartbeat(
        &self,
        device: &Device,
        event: Option<&NewEvent>,
    ) -> Result<Option<i64>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let event_id = match event {
            Some(ev) => {
                tx.execute(
                    "INSERT INTO events (device_id, started, ended, downtime, old_ip, new_ip)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        device.id,
                        ev.started.as_ref().map(format_db_time),
                        format_db_time(&ev.ended),
                        ev.downtime,
                        ev.old_ip,
                        ev.new_ip,
                    ],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        write_device(&tx, device)?;
        tx.execute(
            "UPDATE devices SET notified_down = ?1 WHERE id = ?2",
            params![device.notified_down, device.id],
        )?;
        tx.commit()?;
        Ok(event_id)
    }

    // --- Down alerts ---

    /// Candidates for a down alert: subscribed, confirmed, not yet alerted,
    /// silent for at least `min_interval` but not dead for ages.
    pub fn due_for_down_alert(&self, now: DateTime<Utc>, limits: &Limits) -> Result<Vec<Device>, DbError> {
        let newest = now - chrono::Duration::seconds(limits.min_interval);
        let oldest = now - chrono::Duration::seconds(limits.max_interval + limits.min_interval * 2);

        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM devices
             WHERE notify_down = 1 AND email_confirmed = 1 AND notified_down = 0
               AND last_seen < ?1 AND last_seen > ?2",
            DEVICE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let devices = stmt
            .query_map(
                params![format_db_time(&newest), format_db_time(&oldest)],
                device_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Latch the down-alert flag, unless a heartbeat arrived after `last_seen`
    /// was read. Returns whether the flag was set.
    pub fn mark_notified_down(&self, id: i64, last_seen: DateTime<Utc>) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET notified_down = 1 WHERE id = ?1 AND last_seen = ?2",
            params![id, format_db_time(&last_seen)],
        )?;
        Ok(changed > 0)
    }

    // --- Events ---

    /// Events of a device, oldest first.
    pub fn events_for_device(&self, device_id: i64) -> Result<Vec<Event>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM events WHERE device_id = ?1 ORDER BY id ASC",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![device_id], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    /// Flip the crossed flag of an event and move its downtime in or out of
    /// `downtime_uncrossed`. Returns the updated device, or `None` when the
    /// event does not belong to the device.
    pub fn toggle_event(&self, device_id: i64, event_id: i64) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let found: Option<(bool, Option<i64>)> = tx
            .query_row(
                "SELECT crossed, downtime FROM events WHERE id = ?1 AND device_id = ?2",
                params![event_id, device_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let Some((crossed, downtime)) = found else {
            return Ok(None);
        };

        let crossed = !crossed;
        let delta = downtime.unwrap_or(0) * if crossed { -1 } else { 1 };

        tx.execute(
            "UPDATE events SET crossed = ?1 WHERE id = ?2",
            params![crossed, event_id],
        )?;
        tx.execute(
            "UPDATE devices SET downtime_uncrossed = downtime_uncrossed + ?1, version = version + 1
             WHERE id = ?2",
            params![delta, device_id],
        )?;
        let device = select_device(&tx, device_id)?;
        tx.commit()?;
        Ok(device)
    }

    /// Set the comment of an event. Returns the updated device, or `None`
    /// when the event does not belong to the device.
    pub fn set_event_comment(
        &self,
        device_id: i64,
        event_id: i64,
        comment: &str,
    ) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE events SET comment = ?1 WHERE id = ?2 AND device_id = ?3",
            params![comment, event_id, device_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        tx.execute(
            "UPDATE devices SET version = version + 1 WHERE id = ?1",
            params![device_id],
        )?;
        let device = select_device(&tx, device_id)?;
        tx.commit()?;
        Ok(device)
    }
}

fn select_device(conn: &Connection, id: i64) -> Result<Option<Device>, DbError> {
    let sql = format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], device_from_row).optional()?)
}

fn write_device(conn: &Connection, d: &Device) -> Result<(), DbError> {
    conn.execute(
        "UPDATE devices SET title=?1, notes=?2, country=?3, location=?4, isp=?5, battery=?6,
         reserve=?7, battery_comment=?8, reserve_comment=?9, public=?10, interval=?11,
         notify_interval=?12, email=?13, email_count=?14, email_sent=?15, email_vcode=?16,
         email_errors=?17, email_confirmed=?18, notify_down=?19, notify_up=?20, created=?21,
         edit_token=?22, view_token=?23, update_token=?24, ip=?25, last_seen=?26, downtime=?27,
         downtime_uncrossed=?28, version=?29
         WHERE id=?30",
        params![
            d.title,
            d.notes,
            d.country,
            d.location,
            d.isp,
            d.battery,
            d.reserve,
            d.battery_comment,
            d.reserve_comment,
            d.public,
            d.interval,
            d.notify_interval,
            d.email,
            d.email_count,
            d.email_sent.as_ref().map(format_db_time),
            d.email_vcode,
            d.email_errors,
            d.email_confirmed,
            d.notify_down,
            d.notify_up,
            d.created.as_ref().map(format_db_time),
            d.edit_token,
            d.view_token,
            d.update_token,
            d.last_ip,
            d.last_seen.as_ref().map(format_db_time),
            d.downtime,
            d.downtime_uncrossed,
            d.version,
            d.id,
        ],
    )?;
    Ok(())
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    Ok(Device {
        id: row.get("id")?,
        title: row.get("title")?,
        notes: row.get("notes")?,
        country: row.get("country")?,
        location: row.get("location")?,
        isp: row.get("isp")?,
        battery: row.get("battery")?,
        reserve: row.get("reserve")?,
        battery_comment: row.get("battery_comment")?,
        reserve_comment: row.get("reserve_comment")?,
        public: row.get("public")?,
        interval: row.get("interval")?,
        notify_interval: row.get("notify_interval")?,
        email: row.get("email")?,
        email_count: row.get("email_count")?,
        email_sent: time_column(row, "email_sent")?,
        email_vcode: row.get("email_vcode")?,
        email_errors: row.get("email_errors")?,
        email_confirmed: row.get("email_confirmed")?,
        notify_down: row.get("notify_down")?,
        notify_up: row.get("notify_up")?,
        created: time_column(row, "created")?,
        edit_token: row.get("edit_token")?,
        view_token: row.get("view_token")?,
        update_token: row.get("update_token")?,
        last_ip: row.get("ip")?,
        last_seen: time_column(row, "last_seen")?,
        downtime: row.get("downtime")?,
        downtime_uncrossed: row.get("downtime_uncrossed")?,
        version: row.get("version")?,
        notified_down: row.get("notified_down")?,
    })
}

fn event_from_row(row: &Row<'_>) -> SqlResult<Event> {
    Ok(Event {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        started: time_column(row, "started")?,
        ended: required_time_column(row, "ended")?,
        downtime: row.get("downtime")?,
        old_ip: row.get("old_ip")?,
        new_ip: row.get("new_ip")?,
        comment: row.get("comment")?,
        crossed: row.get("crossed")?,
    })
}

fn time_column(row: &Row<'_>, name: &str) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| {
        parse_db_time(&s).ok_or_else(|| {
            let idx = row.as_ref().column_index(name).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("invalid timestamp in {}: {:?}", name, s).into(),
            )
        })
    })
    .transpose()
}

fn required_time_column(row: &Row<'_>, name: &str) -> SqlResult<DateTime<Utc>> {
    time_column(row, name)?.ok_or_else(|| {
        let idx = row.as_ref().column_index(name).unwrap_or_default();
        rusqlite::Error::InvalidColumnType(idx, name.to_string(), Type::Null)
    })
}

/// Format a timestamp for storage. The format sorts lexicographically.
fn format_db_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A store backed by a temporary file, for tests across the crate.
#[cfg(test)]
pub fn temp_store() -> (tempfile::NamedTempFile, Arc<Store>) {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(Store::new(tmp.path()).unwrap());
    (tmp, store)
}
