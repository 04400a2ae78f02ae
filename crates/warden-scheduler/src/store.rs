//! `ScheduleStore`: durable home of schedules and their execution history.
//!
//! The store is the source of truth: the in-memory scheduler can always be
//! rebuilt from it. Recording an execution (history row + `last_run`,
//! `next_run` and failure counter) is a single atomic operation.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, instrument, warn};
use warden_core::ScheduleId;

use crate::{
    db::{init_db, parse_ts, ts},
    error::{Result, SchedulerError},
    types::{ActiveHours, ExecutionRecord, ScheduleConfig, TriggerType},
};

/// Persistence seam for schedules and execution history.
pub trait ScheduleStore: Send + Sync {
    /// Persist a new schedule. `DuplicateJob` when the (subject, job type)
    /// pair or the id already exists.
    fn insert(&self, config: &ScheduleConfig) -> Result<()>;

    fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleConfig>>;

    fn find(&self, subject_id: &str, job_type: &str) -> Result<Option<ScheduleConfig>>;

    /// Every schedule, oldest first.
    fn list(&self) -> Result<Vec<ScheduleConfig>>;

    fn list_enabled(&self) -> Result<Vec<ScheduleConfig>>;

    /// Overwrite the mutable fields of an existing schedule.
    fn update(&self, config: &ScheduleConfig) -> Result<()>;

    /// Move `next_run` only; history and `last_run` are untouched.
    fn set_next_run(&self, id: &ScheduleId, next_run: Option<DateTime<Utc>>) -> Result<()>;

    /// Delete a schedule and its history. `false` when nothing was deleted.
    fn delete(&self, id: &ScheduleId) -> Result<bool>;

    /// Atomically append `record` and advance the schedule:
    /// `last_run = completed_at`, `next_run`, and the failure counter
    /// (reset on success, incremented on failure). A schedule disabled in
    /// the meantime keeps `next_run = NULL`.
    ///
    /// Returns the updated schedule.
    fn record_execution(
        &self,
        record: &ExecutionRecord,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduleConfig>;

    /// Most recent executions first, at most `limit`.
    fn history(&self, id: &ScheduleId, limit: usize) -> Result<Vec<ExecutionRecord>>;
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

const SCHEDULE_COLUMNS: &str = "id, subject_id, job_type, interval_hours, active_start, active_end,
     enabled, last_run, next_run, consecutive_failures, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, schedule_id, started_at, completed_at, success,
     items_processed, error_message, trigger_type";

/// rusqlite-backed store. One connection behind a mutex; every call is short.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap `conn`, enabling foreign keys and creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("connection lock poisoned".to_string()))
    }

    fn query_schedules(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ScheduleConfig>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules {filter}");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows: Vec<ScheduleRow> = stmt
            .query_map(params, ScheduleRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(config) => configs.push(config),
                // One bad row must not hide every other schedule.
                Err(e) => warn!(error = %e, "skipping undecodable schedule row"),
            }
        }
        Ok(configs)
    }

    fn get_in(conn: &Connection, id: &ScheduleId) -> Result<Option<ScheduleConfig>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1");
        let row = conn
            .query_row(&sql, [id.as_str()], ScheduleRow::from_row)
            .optional()?;
        row.map(ScheduleRow::decode).transpose()
    }
}

impl ScheduleStore for SqliteStore {
    #[instrument(skip(self, config), fields(schedule_id = %config.id))]
    fn insert(&self, config: &ScheduleConfig) -> Result<()> {
        let conn = self.lock()?;
        let (active_start, active_end) = split_hours(config.active_hours);
        let inserted = conn.execute(
            "INSERT INTO schedules
             (id, subject_id, job_type, interval_hours, active_start, active_end,
              enabled, last_run, next_run, consecutive_failures, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                config.id.as_str(),
                config.subject_id,
                config.job_type,
                config.interval_hours,
                active_start,
                active_end,
                config.enabled,
                config.last_run.map(ts),
                config.next_run.map(ts),
                config.consecutive_failures,
                ts(config.created_at),
                ts(config.updated_at),
            ],
        );
        match inserted {
            Ok(_) => {
                debug!(schedule_id = %config.id, "schedule row inserted");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(SchedulerError::DuplicateJob {
                    key: format!("{}/{}", config.subject_id, config.job_type),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleConfig>> {
        let conn = self.lock()?;
        Self::get_in(&conn, id)
    }

    fn find(&self, subject_id: &str, job_type: &str) -> Result<Option<ScheduleConfig>> {
        let conn = self.lock()?;
        let mut found = Self::query_schedules(
            &conn,
            "WHERE subject_id = ?1 AND job_type = ?2",
            params![subject_id, job_type],
        )?;
        Ok(found.pop())
    }

    fn list(&self) -> Result<Vec<ScheduleConfig>> {
        let conn = self.lock()?;
        Self::query_schedules(&conn, "ORDER BY created_at, id", [])
    }

    fn list_enabled(&self) -> Result<Vec<ScheduleConfig>> {
        let conn = self.lock()?;
        Self::query_schedules(&conn, "WHERE enabled = 1 ORDER BY created_at, id", [])
    }

    fn update(&self, config: &ScheduleConfig) -> Result<()> {
        let conn = self.lock()?;
        let (active_start, active_end) = split_hours(config.active_hours);
        let n = conn.execute(
            "UPDATE schedules SET interval_hours=?1, active_start=?2, active_end=?3,
              enabled=?4, next_run=?5, updated_at=?6
             WHERE id=?7",
            params![
                config.interval_hours,
                active_start,
                active_end,
                config.enabled,
                config.next_run.map(ts),
                ts(config.updated_at),
                config.id.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found(&config.id));
        }
        Ok(())
    }

    fn set_next_run(&self, id: &ScheduleId, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE schedules SET next_run=?1 WHERE id=?2",
            params![next_run.map(ts), id.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &ScheduleId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM executions WHERE schedule_id = ?1", [id.as_str()])?;
        let n = tx.execute("DELETE FROM schedules WHERE id = ?1", [id.as_str()])?;
        tx.commit()?;
        if n > 0 {
            info!(schedule_id = %id, "schedule deleted");
        }
        Ok(n > 0)
    }

    #[instrument(
        skip(self, record),
        fields(schedule_id = %record.schedule_id, success = record.success)
    )]
    fn record_execution(
        &self,
        record: &ExecutionRecord,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduleConfig> {
        let completed_at = record.completed_at.ok_or_else(|| SchedulerError::Corrupt {
            id: record.schedule_id.to_string(),
            reason: "execution record has no completion time".to_string(),
        })?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let n = tx.execute(
            "UPDATE schedules SET
               last_run = ?1,
               next_run = CASE WHEN enabled = 1 THEN ?2 ELSE NULL END,
               consecutive_failures = CASE WHEN ?3 THEN 0 ELSE consecutive_failures + 1 END,
               updated_at = ?1
             WHERE id = ?4",
            params![
                ts(completed_at),
                ts(next_run),
                record.success,
                record.schedule_id.as_str()
            ],
        )?;
        if n == 0 {
            // Dropping `tx` rolls back.
            return Err(SchedulerError::not_found(&record.schedule_id));
        }

        tx.execute(
            "INSERT INTO executions
             (schedule_id, started_at, completed_at, success, items_processed,
              error_message, trigger_type)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                record.schedule_id.as_str(),
                ts(record.started_at),
                ts(completed_at),
                record.success,
                i64::try_from(record.items_processed).unwrap_or(i64::MAX),
                record.error_message,
                record.trigger_type.to_string(),
            ],
        )?;

        let updated = Self::get_in(&tx, &record.schedule_id)?
            .ok_or_else(|| SchedulerError::not_found(&record.schedule_id))?;
        tx.commit()?;
        Ok(updated)
    }

    fn history(&self, id: &ScheduleId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE schedule_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<ExecutionRow> = stmt
            .query_map(params![id.as_str(), limit], ExecutionRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(ExecutionRow::decode).collect()
    }
}

fn split_hours(hours: Option<ActiveHours>) -> (Option<u8>, Option<u8>) {
    match hours {
        Some(h) => (Some(h.start), Some(h.end)),
        None => (None, None),
    }
}

// --- row decoding ------------------------------------------------------------

struct ScheduleRow {
    id: String,
    subject_id: String,
    job_type: String,
    interval_hours: f64,
    active_start: Option<u8>,
    active_end: Option<u8>,
    enabled: bool,
    last_run: Option<String>,
    next_run: Option<String>,
    consecutive_failures: u32,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            job_type: row.get(2)?,
            interval_hours: row.get(3)?,
            active_start: row.get(4)?,
            active_end: row.get(5)?,
            enabled: row.get(6)?,
            last_run: row.get(7)?,
            next_run: row.get(8)?,
            consecutive_failures: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<ScheduleConfig> {
        let corrupt = |reason: String| SchedulerError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let time = |s: &str| parse_ts(s).map_err(|e| corrupt(format!("bad timestamp {s:?}: {e}")));
        let opt_time = |s: &Option<String>| s.as_deref().map(time).transpose();

        let active_hours = match (self.active_start, self.active_end) {
            (Some(start), Some(end)) => Some(ActiveHours::new(start, end)),
            (None, None) => None,
            _ => return Err(corrupt("half-set active hours".to_string())),
        };

        Ok(ScheduleConfig {
            id: ScheduleId::from(self.id.as_str()),
            active_hours,
            last_run: opt_time(&self.last_run)?,
            next_run: opt_time(&self.next_run)?,
            created_at: time(&self.created_at)?,
            updated_at: time(&self.updated_at)?,
            subject_id: self.subject_id.clone(),
            job_type: self.job_type.clone(),
            interval_hours: self.interval_hours,
            enabled: self.enabled,
            consecutive_failures: self.consecutive_failures,
        })
    }
}

struct ExecutionRow {
    id: i64,
    schedule_id: String,
    started_at: String,
    completed_at: Option<String>,
    success: bool,
    items_processed: i64,
    error_message: Option<String>,
    trigger_type: String,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            success: row.get(4)?,
            items_processed: row.get(5)?,
            error_message: row.get(6)?,
            trigger_type: row.get(7)?,
        })
    }

    fn decode(self) -> Result<ExecutionRecord> {
        let corrupt = |reason: String| SchedulerError::Corrupt {
            id: self.schedule_id.clone(),
            reason,
        };
        let time = |s: &str| parse_ts(s).map_err(|e| corrupt(format!("bad timestamp {s:?}: {e}")));
        let trigger_type: TriggerType = self.trigger_type.parse().map_err(&corrupt)?;

        Ok(ExecutionRecord {
            id: Some(self.id),
            schedule_id: ScheduleId::from(self.schedule_id.as_str()),
            started_at: time(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(time).transpose()?,
            success: self.success,
            items_processed: u64::try_from(self.items_processed).unwrap_or(0),
            error_message: self.error_message.clone(),
            trigger_type,
        })
    }
}
