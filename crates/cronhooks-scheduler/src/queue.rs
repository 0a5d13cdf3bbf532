//! Durable in-process task queue implementing [`DispatchGateway`].
//!
//! Deferred dispatches live in `dispatches` until claimed; periodic bindings
//! live in `periodic_bindings` with a precomputed `next_run`. Due times are
//! INTEGER epoch milliseconds so ordering holds for any representable
//! instant, however far out a retry is pushed. The
//! [`crate::engine::QueueEngine`] polls [`LocalQueue::claim_due`] and hands
//! the deliveries to the executor.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronhooks_core::JobId;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{conversion_error, fmt_ts};
use crate::error::DispatchError;
use crate::gateway::{Delivery, DispatchGateway};
use crate::registry::PeriodicTrigger;
use crate::schedule::{parse_timezone, CronFields};
use crate::types::{DispatchHandle, TriggerId};

type QueueResult<T> = std::result::Result<T, DispatchError>;

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(&ms.to_string(), "timestamp out of range"))
}

/// Create the queue tables in `conn` (idempotent).
pub fn init_queue_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dispatches (
            handle          TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL,
            attempt_number  INTEGER NOT NULL CHECK (attempt_number >= 1),
            run_at          INTEGER NOT NULL,  -- epoch ms
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_dispatches_due ON dispatches (run_at);

        CREATE TABLE IF NOT EXISTS periodic_bindings (
            job_id           TEXT    NOT NULL PRIMARY KEY,
            trigger_id       INTEGER NOT NULL,
            cron_expression  TEXT    NOT NULL,
            timezone         TEXT    NOT NULL,
            enabled          INTEGER NOT NULL DEFAULT 0,
            next_run         INTEGER NOT NULL,  -- epoch ms
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_bindings_due ON periodic_bindings (enabled, next_run);
        ",
    )
}

/// A deferred dispatch waiting for its `run_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDispatch {
    pub handle: DispatchHandle,
    pub job_id: JobId,
    pub attempt_number: u32,
    pub run_at: DateTime<Utc>,
}

/// A recurring job's binding to its periodic trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicBinding {
    pub job_id: JobId,
    pub trigger_id: TriggerId,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
}

pub struct LocalQueue {
    db: Mutex<Connection>,
}

impl LocalQueue {
    pub fn new(conn: Connection) -> QueueResult<Self> {
        init_queue_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> QueueResult<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_dispatch(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        run_at: DateTime<Utc>,
    ) -> QueueResult<DispatchHandle> {
        let handle = DispatchHandle(Uuid::new_v4().to_string());
        self.conn().execute(
            "INSERT INTO dispatches (handle, job_id, attempt_number, run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                handle.as_str(),
                job_id.as_str(),
                attempt_number,
                to_millis(run_at),
                fmt_ts(Utc::now()),
            ],
        )?;
        debug!(job_id = %job_id, attempt = attempt_number, run_at = %run_at, %handle, "dispatch enqueued");
        Ok(handle)
    }

    /// Claim up to `limit` deliveries due at `now`.
    ///
    /// Deferred dispatches are deleted as they are claimed, so a dispatch is
    /// delivered at most once. Each due periodic binding yields one delivery
    /// (attempt 1) and advances to its next fire strictly after `now`; fires
    /// missed while the service was down collapse into that single delivery.
    #[instrument(skip(self))]
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Delivery>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_millis(now);
        let now_str = fmt_ts(now);
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut deliveries: Vec<Delivery> = {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM dispatches
                 WHERE handle IN (SELECT handle FROM dispatches
                                  WHERE run_at <= ?1
                                  ORDER BY run_at LIMIT ?2)
                 RETURNING job_id, attempt_number",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![now_ms, limit as i64], |row| {
                    Ok(Delivery {
                        job_id: JobId::from(row.get::<_, String>(0)?),
                        attempt_number: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let remaining = limit.saturating_sub(deliveries.len());
        if remaining > 0 {
            let due: Vec<(String, String, String)> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT job_id, cron_expression, timezone FROM periodic_bindings
                     WHERE enabled = 1 AND next_run <= ?1
                     ORDER BY next_run LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms, remaining as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            for (job_id, cron_expression, timezone) in due {
                match next_run(&cron_expression, &timezone, now) {
                    Ok(next) => {
                        tx.execute(
                            "UPDATE periodic_bindings SET next_run = ?2, updated_at = ?3
                             WHERE job_id = ?1",
                            rusqlite::params![job_id, to_millis(next), now_str],
                        )?;
                        deliveries.push(Delivery {
                            job_id: JobId::from(job_id),
                            attempt_number: 1,
                        });
                    }
                    Err(e) => {
                        warn!(%job_id, cron = %cron_expression, "disabling periodic binding: {e}");
                        tx.execute(
                            "UPDATE periodic_bindings SET enabled = 0, updated_at = ?2
                             WHERE job_id = ?1",
                            rusqlite::params![job_id, now_str],
                        )?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(deliveries)
    }

    /// Deferred dispatches for `job_id`, soonest first.
    pub fn pending_for(&self, job_id: &JobId) -> QueueResult<Vec<PendingDispatch>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT handle, job_id, attempt_number, run_at FROM dispatches
             WHERE job_id = ?1 ORDER BY run_at, created_at",
        )?;
        let rows = stmt
            .query_map([job_id.as_str()], |row| {
                Ok(PendingDispatch {
                    handle: DispatchHandle(row.get(0)?),
                    job_id: JobId::from(row.get::<_, String>(1)?),
                    attempt_number: row.get(2)?,
                    run_at: from_millis(row.get(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn binding(&self, job_id: &JobId) -> QueueResult<Option<PeriodicBinding>> {
        let binding = self
            .conn()
            .query_row(
                "SELECT job_id, trigger_id, cron_expression, timezone, enabled, next_run
                 FROM periodic_bindings WHERE job_id = ?1",
                [job_id.as_str()],
                |row| {
                    Ok(PeriodicBinding {
                        job_id: JobId::from(row.get::<_, String>(0)?),
                        trigger_id: row.get(1)?,
                        cron_expression: row.get(2)?,
                        timezone: row.get(3)?,
                        enabled: row.get(4)?,
                        next_run: from_millis(row.get(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(binding)
    }
}

fn next_run(cron_expression: &str, timezone: &str, after: DateTime<Utc>) -> QueueResult<DateTime<Utc>> {
    let cadence = |e: crate::error::SchedulerError| DispatchError::InvalidCadence(e.to_string());
    let fields = CronFields::parse(cron_expression).map_err(cadence)?;
    let tz = parse_timezone(timezone).map_err(cadence)?;
    fields.next_after(tz, after).map_err(cadence)
}

#[async_trait]
impl DispatchGateway for LocalQueue {
    async fn enqueue_at(
        &self,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> QueueResult<DispatchHandle> {
        self.insert_dispatch(job_id, 1, at)
    }

    async fn enqueue_now(
        &self,
        job_id: &JobId,
        attempt_number: u32,
    ) -> QueueResult<DispatchHandle> {
        self.insert_dispatch(job_id, attempt_number, Utc::now())
    }

    async fn enqueue_after(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        delay: Duration,
    ) -> QueueResult<DispatchHandle> {
        let now = Utc::now();
        let run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.insert_dispatch(job_id, attempt_number, run_at)
    }

    async fn revoke(&self, handle: &DispatchHandle) -> QueueResult<()> {
        let n = self
            .conn()
            .execute("DELETE FROM dispatches WHERE handle = ?1", [handle.as_str()])?;
        if n == 0 {
            return Err(DispatchError::UnknownHandle(handle.to_string()));
        }
        debug!(%handle, "dispatch revoked");
        Ok(())
    }

    async fn register_periodic(
        &self,
        job_id: &JobId,
        trigger: &PeriodicTrigger,
        enabled: bool,
    ) -> QueueResult<()> {
        let now = Utc::now();
        let expression = trigger.fields.expression();
        let next = next_run(&expression, &trigger.timezone, now)?;
        self.conn().execute(
            "INSERT INTO periodic_bindings
             (job_id, trigger_id, cron_expression, timezone, enabled, next_run, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (job_id) DO UPDATE SET
                trigger_id = excluded.trigger_id,
                cron_expression = excluded.cron_expression,
                timezone = excluded.timezone,
                enabled = excluded.enabled,
                next_run = excluded.next_run,
                updated_at = excluded.updated_at",
            rusqlite::params![
                job_id.as_str(),
                trigger.id,
                expression,
                trigger.timezone,
                enabled,
                to_millis(next),
                fmt_ts(now),
            ],
        )?;
        info!(job_id = %job_id, trigger_id = trigger.id, enabled, next_run = %next, "periodic dispatch registered");
        Ok(())
    }

    async fn set_periodic_enabled(
        &self,
        job_id: &JobId,
        trigger_id: TriggerId,
        enabled: bool,
    ) -> QueueResult<()> {
        let db = self.conn();
        let cadence: Option<(String, String)> = db
            .query_row(
                "SELECT cron_expression, timezone FROM periodic_bindings
                 WHERE job_id = ?1 AND trigger_id = ?2",
                rusqlite::params![job_id.as_str(), trigger_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((cron_expression, timezone)) = cadence else {
            return Err(DispatchError::UnknownBinding(job_id.clone()));
        };

        let now = Utc::now();
        if enabled {
            // Re-anchor so a long-disabled binding does not fire immediately.
            let next = next_run(&cron_expression, &timezone, now)?;
            db.execute(
                "UPDATE periodic_bindings SET enabled = 1, next_run = ?2, updated_at = ?3
                 WHERE job_id = ?1",
                rusqlite::params![job_id.as_str(), to_millis(next), fmt_ts(now)],
            )?;
        } else {
            db.execute(
                "UPDATE periodic_bindings SET enabled = 0, updated_at = ?2 WHERE job_id = ?1",
                rusqlite::params![job_id.as_str(), fmt_ts(now)],
            )?;
        }
        debug!(job_id = %job_id, trigger_id, enabled, "periodic dispatch toggled");
        Ok(())
    }

    async fn remove_periodic(&self, job_id: &JobId) -> QueueResult<()> {
        let n = self.conn().execute(
            "DELETE FROM periodic_bindings WHERE job_id = ?1",
            [job_id.as_str()],
        )?;
        if n == 0 {
            return Err(DispatchError::UnknownBinding(job_id.clone()));
        }
        debug!(job_id = %job_id, "periodic binding removed");
        Ok(())
    }
}
