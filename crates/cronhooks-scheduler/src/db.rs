use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Wall-clock format for `jobs.fire_at` (no offset: the job's timezone applies).
const WALL_CLOCK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Initialise the engine schema in `conn`.
///
/// Creates the `periodic_triggers`, `jobs` and `execution_attempts` tables
/// (idempotent). `foreign_keys` must be ON for the attempt cascade to apply.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periodic_triggers (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            minute        TEXT    NOT NULL,
            hour          TEXT    NOT NULL,
            day_of_month  TEXT    NOT NULL,
            month         TEXT    NOT NULL,
            day_of_week   TEXT    NOT NULL,
            timezone      TEXT    NOT NULL,
            enabled       INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT    NOT NULL,
            UNIQUE (minute, hour, day_of_month, month, day_of_week, timezone)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobs (
            id                    TEXT    NOT NULL PRIMARY KEY,
            name                  TEXT    NOT NULL,
            schedule_kind         TEXT    NOT NULL CHECK (schedule_kind IN ('once', 'recurring')),
            fire_at               TEXT,               -- wall clock in `timezone`
            cron_expression       TEXT,
            timezone              TEXT    NOT NULL DEFAULT 'UTC',
            dispatch_handle       TEXT,
            periodic_handle       INTEGER REFERENCES periodic_triggers (id),
            method                TEXT    NOT NULL,
            url                   TEXT    NOT NULL,
            headers               TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            body                  TEXT    NOT NULL DEFAULT 'null', -- JSON value
            is_active             INTEGER NOT NULL DEFAULT 1,
            max_retries           INTEGER NOT NULL CHECK (max_retries >= 0),
            retry_base_delay_secs INTEGER NOT NULL CHECK (retry_base_delay_secs >= 0),
            timeout_secs          INTEGER NOT NULL CHECK (timeout_secs > 0),
            last_execution_at     TEXT,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL,
            CHECK (
                (schedule_kind = 'once' AND fire_at IS NOT NULL AND cron_expression IS NULL)
                OR
                (schedule_kind = 'recurring' AND cron_expression IS NOT NULL AND fire_at IS NULL)
            )
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_active ON jobs (is_active, schedule_kind);
        CREATE INDEX IF NOT EXISTS idx_jobs_trigger ON jobs (periodic_handle);

        CREATE TABLE IF NOT EXISTS execution_attempts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          TEXT    NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            status          TEXT    NOT NULL DEFAULT 'pending',
            attempt_number  INTEGER NOT NULL CHECK (attempt_number >= 1),
            response_code   INTEGER,
            response_body   TEXT    NOT NULL DEFAULT '',
            error_message   TEXT    NOT NULL DEFAULT '',
            executed_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_attempts_job ON execution_attempts (job_id, executed_at DESC);
        CREATE INDEX IF NOT EXISTS idx_attempts_status ON execution_attempts (job_id, status);
        ",
    )?;
    Ok(())
}

/// Format an instant for storage. Fixed width so lexical order is chronological.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored instant; used inside row mappers.
pub fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(s, e))
}

pub fn fmt_wall_clock(t: NaiveDateTime) -> String {
    t.format(WALL_CLOCK_FORMAT).to_string()
}

pub fn parse_wall_clock_column(s: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, WALL_CLOCK_FORMAT).map_err(|e| conversion_error(s, e))
}

/// Wrap a column decoding failure as a rusqlite error.
pub fn conversion_error<E>(value: &str, err: E) -> rusqlite::Error
where
    E: std::fmt::Display,
{
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("bad column value {value:?}: {err}").into(),
    )
}
