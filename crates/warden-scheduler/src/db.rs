use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules` and `executions` tables (idempotent). One schedule
/// per (subject, job type); executions are append-only and go away only with
/// their schedule.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id                    TEXT    NOT NULL PRIMARY KEY,
            subject_id            TEXT    NOT NULL,
            job_type              TEXT    NOT NULL,
            interval_hours        REAL    NOT NULL CHECK (interval_hours > 0),
            active_start          INTEGER,            -- NULL when no window
            active_end            INTEGER,
            enabled               INTEGER NOT NULL DEFAULT 1,
            last_run              TEXT,               -- RFC 3339 UTC or NULL
            next_run              TEXT,               -- NULL only while disabled
            consecutive_failures  INTEGER NOT NULL DEFAULT 0 CHECK (consecutive_failures >= 0),
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL,
            UNIQUE (subject_id, job_type)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (next_run);

        CREATE TABLE IF NOT EXISTS executions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id      TEXT    NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
            started_at       TEXT    NOT NULL,
            completed_at     TEXT,
            success          INTEGER NOT NULL,
            items_processed  INTEGER NOT NULL DEFAULT 0,
            error_message    TEXT,
            trigger_type     TEXT    NOT NULL CHECK (trigger_type IN ('scheduled', 'manual'))
        ) STRICT;

        -- ListHistory: WHERE schedule_id = ? ORDER BY started_at DESC
        CREATE INDEX IF NOT EXISTS idx_executions_schedule
            ON executions (schedule_id, started_at DESC);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps also sort lexicographically.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
