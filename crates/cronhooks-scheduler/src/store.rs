//! Job Store: typed repositories for jobs and execution attempts, and their
//! SQLite implementation.
//!
//! Every mutation is a narrow column update so concurrent workers never
//! overwrite each other's fields with a stale copy of the row.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use cronhooks_core::JobId;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument, warn};

use crate::db::{
    conversion_error, fmt_ts, fmt_wall_clock, init_db, parse_ts, parse_wall_clock_column,
};
use crate::error::{Result, SchedulerError};
use crate::registry::TriggerRegistry;
use crate::types::{
    AttemptStatus, DispatchHandle, ExecutionAttempt, ExecutionSummary, HttpMethod, Job,
    JobDefinition, JobFilter, Page, Schedule, ScheduleKind, TriggerId, WebhookTarget,
};

/// Slack on top of a job's timeout before a `pending` attempt is presumed
/// abandoned (worker crashed or could not record the outcome).
pub const STALE_ATTEMPT_GRACE_SECS: u64 = 60;

/// Error text stored on an attempt reclaimed as abandoned.
pub const ABANDONED_ATTEMPT_MESSAGE: &str = "Attempt abandoned before its outcome was recorded";

/// Persistence for job records.
pub trait JobStore: Send + Sync {
    /// Insert a new, active job.
    fn insert_job(&self, def: &JobDefinition) -> Result<Job>;
    fn get_job(&self, id: &JobId) -> Result<Option<Job>>;
    /// Jobs matching `filter`, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    /// Overwrite the user-editable definition and clear both handles.
    /// Returns false when the job does not exist.
    fn replace_definition(&self, id: &JobId, def: &JobDefinition) -> Result<bool>;
    /// Returns false when the job does not exist.
    fn set_active(&self, id: &JobId, active: bool) -> Result<bool>;
    fn set_dispatch_handle(&self, id: &JobId, handle: Option<&DispatchHandle>) -> Result<()>;
    fn set_periodic_handle(&self, id: &JobId, trigger: Option<TriggerId>) -> Result<()>;
    /// Delete the job and, by cascade, its attempts. Returns false when absent.
    fn delete_job(&self, id: &JobId) -> Result<bool>;
}

/// Result of trying to open a new attempt row.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptClaim {
    /// A Pending row was created; the caller owns this attempt.
    Started(ExecutionAttempt),
    NotFound,
    Inactive,
    /// One-shot job already has a successful attempt; it has been deactivated.
    AlreadySucceeded,
    /// One-shot job already has this attempt number in flight (duplicate delivery).
    InFlight,
}

/// What an attempt ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub response_code: Option<u16>,
    pub response_body: String,
    pub error_message: String,
}

/// Persistence for execution attempts.
pub trait AttemptStore: Send + Sync {
    /// Atomically check the job is runnable and insert a Pending attempt.
    ///
    /// For one-shot jobs this is also the idempotency guard: a prior Success
    /// deactivates the job instead of starting an attempt.
    fn begin_attempt(&self, job_id: &JobId, attempt_number: u32) -> Result<AttemptClaim>;
    /// Record the outcome, stamp `last_execution_at`, and optionally deactivate
    /// the job, all in one transaction.
    fn finish_attempt(
        &self,
        attempt_id: i64,
        job_id: &JobId,
        outcome: &AttemptOutcome,
        deactivate_job: bool,
    ) -> Result<()>;
    /// Flag a failed attempt as superseded by an enqueued retry.
    fn mark_retrying(&self, attempt_id: i64) -> Result<()>;
    /// A window of a job's attempts, newest first.
    fn list_attempts_page(&self, job_id: &JobId, page: Page) -> Result<Vec<ExecutionAttempt>>;
    /// All attempts for a job, newest first.
    fn list_attempts(&self, job_id: &JobId) -> Result<Vec<ExecutionAttempt>> {
        self.list_attempts_page(job_id, Page::default())
    }
    fn exists_success_attempt(&self, job_id: &JobId) -> Result<bool>;
    /// Attempt count and newest status per job, for one job or for all.
    /// Jobs without attempts are absent from the map.
    fn execution_summaries(
        &self,
        job_id: Option<&JobId>,
    ) -> Result<HashMap<JobId, ExecutionSummary>>;
}

/// The full storage surface the engine needs.
pub trait WebhookStore: JobStore + AttemptStore + TriggerRegistry {}

impl<T: JobStore + AttemptStore + TriggerRegistry> WebhookStore for T {}

const JOB_COLUMNS: &str = "id, name, schedule_kind, fire_at, cron_expression, timezone,
     dispatch_handle, periodic_handle, method, url, headers, body, is_active,
     max_retries, retry_base_delay_secs, timeout_secs, last_execution_at,
     created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, job_id, status, attempt_number, response_code,
     response_body, error_message, executed_at";

/// SQLite-backed store for jobs, attempts and periodic triggers.
///
/// Wraps a single connection in a `Mutex`; attempt claims run inside an
/// IMMEDIATE transaction so the check-then-insert is serialised.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, enabling foreign keys and creating the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Seconds fields as SQLite integers; values past `i64::MAX` are refused
/// rather than wrapped.
fn secs_column(field: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| SchedulerError::InvalidJob(format!("{field} out of range: {value}")))
}

fn secs_from_column(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|e| conversion_error(&value.to_string(), e))
}

/// Schedule columns (kind, fire_at, cron_expression) for a definition.
fn schedule_columns(schedule: &Schedule) -> (String, Option<String>, Option<String>) {
    match schedule {
        Schedule::Once { fire_at } => (
            ScheduleKind::Once.to_string(),
            Some(fmt_wall_clock(*fire_at)),
            None,
        ),
        Schedule::Recurring { cron_expression } => (
            ScheduleKind::Recurring.to_string(),
            None,
            Some(cron_expression.clone()),
        ),
    }
}

impl JobStore for SqliteStore {
    #[instrument(skip(self, def), fields(name = %def.name))]
    fn insert_job(&self, def: &JobDefinition) -> Result<Job> {
        let id = JobId::new();
        let now = Utc::now();
        let now_str = fmt_ts(now);
        let (kind, fire_at, cron) = schedule_columns(&def.schedule);
        let headers = serde_json::to_string(&def.target.headers)?;
        let body = serde_json::to_string(&def.target.body)?;
        let retry_delay = secs_column("retry_base_delay_secs", def.retry_base_delay_secs)?;
        let timeout = secs_column("timeout_secs", def.timeout_secs)?;

        self.conn().execute(
            "INSERT INTO jobs
             (id, name, schedule_kind, fire_at, cron_expression, timezone, method, url,
              headers, body, is_active, max_retries, retry_base_delay_secs, timeout_secs,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,1,?11,?12,?13,?14,?14)",
            rusqlite::params![
                id.as_str(),
                def.name,
                kind,
                fire_at,
                cron,
                def.timezone,
                def.target.method.as_str(),
                def.target.url,
                headers,
                body,
                def.max_retries,
                retry_delay,
                timeout,
                now_str,
            ],
        )?;
        debug!(job_id = %id, "job inserted");

        Ok(Job {
            id,
            name: def.name.clone(),
            schedule: def.schedule.clone(),
            timezone: def.timezone.clone(),
            target: def.target.clone(),
            is_active: true,
            dispatch_handle: None,
            periodic_handle: None,
            max_retries: def.max_retries,
            retry_base_delay_secs: def.retry_base_delay_secs,
            timeout_secs: def.timeout_secs,
            last_execution_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let job = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR schedule_kind = ?1)
               AND (?2 IS NULL OR is_active = ?2)
               AND (?3 IS NULL OR method = ?3)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let jobs = stmt
            .query_map(
                rusqlite::params![
                    filter.schedule_kind.map(|k| k.to_string()),
                    filter.is_active,
                    filter.method.map(|m| m.as_str()),
                ],
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip(self, def), fields(job_id = %id))]
    fn replace_definition(&self, id: &JobId, def: &JobDefinition) -> Result<bool> {
        let (kind, fire_at, cron) = schedule_columns(&def.schedule);
        let headers = serde_json::to_string(&def.target.headers)?;
        let body = serde_json::to_string(&def.target.body)?;
        let retry_delay = secs_column("retry_base_delay_secs", def.retry_base_delay_secs)?;
        let timeout = secs_column("timeout_secs", def.timeout_secs)?;
        let n = self.conn().execute(
            "UPDATE jobs SET
                name = ?2, schedule_kind = ?3, fire_at = ?4, cron_expression = ?5,
                timezone = ?6, method = ?7, url = ?8, headers = ?9, body = ?10,
                max_retries = ?11, retry_base_delay_secs = ?12, timeout_secs = ?13,
                dispatch_handle = NULL, periodic_handle = NULL, updated_at = ?14
             WHERE id = ?1",
            rusqlite::params![
                id.as_str(),
                def.name,
                kind,
                fire_at,
                cron,
                def.timezone,
                def.target.method.as_str(),
                def.target.url,
                headers,
                body,
                def.max_retries,
                retry_delay,
                timeout,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(n > 0)
    }

    fn set_active(&self, id: &JobId, active: bool) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE jobs SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id.as_str(), active, fmt_ts(Utc::now())],
        )?;
        Ok(n > 0)
    }

    fn set_dispatch_handle(&self, id: &JobId, handle: Option<&DispatchHandle>) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET dispatch_handle = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![
                id.as_str(),
                handle.map(DispatchHandle::as_str),
                fmt_ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    fn set_periodic_handle(&self, id: &JobId, trigger: Option<TriggerId>) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET periodic_handle = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id.as_str(), trigger, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    fn delete_job(&self, id: &JobId) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        Ok(n > 0)
    }
}

impl AttemptStore for SqliteStore {
    #[instrument(skip(self), fields(job_id = %job_id, attempt = attempt_number))]
    fn begin_attempt(&self, job_id: &JobId, attempt_number: u32) -> Result<AttemptClaim> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, bool, i64)> = tx
            .query_row(
                "SELECT schedule_kind, is_active, timeout_secs FROM jobs WHERE id = ?1",
                [job_id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((kind, active, timeout_secs)) = row else {
            return Ok(AttemptClaim::NotFound);
        };
        if !active {
            return Ok(AttemptClaim::Inactive);
        }

        if kind == ScheduleKind::Once.to_string() {
            let succeeded: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM execution_attempts
                                WHERE job_id = ?1 AND status = 'success')",
                [job_id.as_str()],
                |r| r.get(0),
            )?;
            if succeeded {
                tx.execute(
                    "UPDATE jobs SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![job_id.as_str(), fmt_ts(Utc::now())],
                )?;
                tx.commit()?;
                return Ok(AttemptClaim::AlreadySucceeded);
            }

            // A pending row older than the call could possibly take was left
            // behind by a worker that died; fail it so the redelivery can run.
            let grace = timeout_secs
                .saturating_add(STALE_ATTEMPT_GRACE_SECS as i64)
                .min(i64::MAX / 1000);
            let stale_before = Utc::now()
                .checked_sub_signed(Duration::seconds(grace))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let reclaimed = tx.execute(
                "UPDATE execution_attempts SET status = 'failed', error_message = ?4
                 WHERE job_id = ?1 AND attempt_number = ?2 AND status = 'pending'
                   AND executed_at < ?3",
                rusqlite::params![
                    job_id.as_str(),
                    attempt_number,
                    fmt_ts(stale_before),
                    ABANDONED_ATTEMPT_MESSAGE
                ],
            )?;
            if reclaimed > 0 {
                warn!(job_id = %job_id, attempt = attempt_number, "reclaimed abandoned attempt");
            }

            let in_flight: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM execution_attempts
                                WHERE job_id = ?1 AND attempt_number = ?2 AND status = 'pending')",
                rusqlite::params![job_id.as_str(), attempt_number],
                |r| r.get(0),
            )?;
            if in_flight {
                tx.commit()?;
                return Ok(AttemptClaim::InFlight);
            }
        }

        let executed_at = Utc::now();
        tx.execute(
            "INSERT INTO execution_attempts (job_id, status, attempt_number, executed_at)
             VALUES (?1, 'pending', ?2, ?3)",
            rusqlite::params![job_id.as_str(), attempt_number, fmt_ts(executed_at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(AttemptClaim::Started(ExecutionAttempt {
            id,
            job_id: job_id.clone(),
            status: AttemptStatus::Pending,
            attempt_number,
            response_code: None,
            response_body: String::new(),
            error_message: String::new(),
            executed_at,
        }))
    }

    #[instrument(skip(self, outcome), fields(job_id = %job_id, status = %outcome.status))]
    fn finish_attempt(
        &self,
        attempt_id: i64,
        job_id: &JobId,
        outcome: &AttemptOutcome,
        deactivate_job: bool,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE execution_attempts
             SET status = ?2, response_code = ?3, response_body = ?4, error_message = ?5
             WHERE id = ?1",
            rusqlite::params![
                attempt_id,
                outcome.status.to_string(),
                outcome.response_code,
                outcome.response_body,
                outcome.error_message,
            ],
        )?;
        let sql = if deactivate_job {
            "UPDATE jobs SET last_execution_at = ?2, is_active = 0, updated_at = ?2 WHERE id = ?1"
        } else {
            "UPDATE jobs SET last_execution_at = ?2, updated_at = ?2 WHERE id = ?1"
        };
        let n = tx.execute(sql, rusqlite::params![job_id.as_str(), now])?;
        if n == 0 {
            warn!(job_id = %job_id, "job vanished while its attempt was running");
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_retrying(&self, attempt_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE execution_attempts SET status = 'retrying' WHERE id = ?1",
            [attempt_id],
        )?;
        Ok(())
    }

    fn list_attempts_page(&self, job_id: &JobId, page: Page) -> Result<Vec<ExecutionAttempt>> {
        // SQLite reads a negative LIMIT as "no limit".
        let limit = page
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM execution_attempts
             WHERE job_id = ?1
             ORDER BY executed_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let attempts = stmt
            .query_map(
                rusqlite::params![job_id.as_str(), limit, offset],
                row_to_attempt,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attempts)
    }

    fn exists_success_attempt(&self, job_id: &JobId) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM execution_attempts
                            WHERE job_id = ?1 AND status = 'success')",
            [job_id.as_str()],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    fn execution_summaries(
        &self,
        job_id: Option<&JobId>,
    ) -> Result<HashMap<JobId, ExecutionSummary>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(
            "SELECT a.job_id, COUNT(*),
                    (SELECT b.status FROM execution_attempts b
                     WHERE b.job_id = a.job_id
                     ORDER BY b.executed_at DESC, b.id DESC LIMIT 1)
             FROM execution_attempts a
             WHERE ?1 IS NULL OR a.job_id = ?1
             GROUP BY a.job_id",
        )?;
        let rows = stmt
            .query_map([job_id.map(JobId::as_str)], |row| {
                let status: Option<String> = row.get(2)?;
                let last_execution_status = status
                    .map(|s| {
                        s.parse::<AttemptStatus>()
                            .map_err(|e: String| conversion_error(&s, e))
                    })
                    .transpose()?;
                Ok((
                    JobId::from(row.get::<_, String>(0)?),
                    ExecutionSummary {
                        execution_count: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                        last_execution_status,
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }
}

/// Map a `jobs` row selected with `JOB_COLUMNS`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let kind_str: String = row.get(2)?;
    let kind: ScheduleKind = kind_str
        .parse()
        .map_err(|e: String| conversion_error(&kind_str, e))?;
    let schedule = match kind {
        ScheduleKind::Once => {
            let fire_at: String = row.get(3)?;
            Schedule::Once {
                fire_at: parse_wall_clock_column(&fire_at)?,
            }
        }
        ScheduleKind::Recurring => Schedule::Recurring {
            cron_expression: row.get(4)?,
        },
    };

    let method_str: String = row.get(8)?;
    let method: HttpMethod = method_str
        .parse()
        .map_err(|e: String| conversion_error(&method_str, e))?;
    let headers_json: String = row.get(10)?;
    let headers: BTreeMap<String, String> =
        serde_json::from_str(&headers_json).map_err(|e| conversion_error(&headers_json, e))?;
    let body_json: String = row.get(11)?;
    let body = serde_json::from_str(&body_json).map_err(|e| conversion_error(&body_json, e))?;

    let last_execution_at = row
        .get::<_, Option<String>>(16)?
        .as_deref()
        .map(parse_ts)
        .transpose()?;

    Ok(Job {
        id: JobId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        schedule,
        timezone: row.get(5)?,
        dispatch_handle: row.get::<_, Option<String>>(6)?.map(DispatchHandle),
        periodic_handle: row.get(7)?,
        target: WebhookTarget {
            method,
            url: row.get(9)?,
            headers,
            body,
        },
        is_active: row.get(12)?,
        max_retries: row.get(13)?,
        retry_base_delay_secs: secs_from_column(row.get(14)?)?,
        timeout_secs: secs_from_column(row.get(15)?)?,
        last_execution_at,
        created_at: parse_ts(&row.get::<_, String>(17)?)?,
        updated_at: parse_ts(&row.get::<_, String>(18)?)?,
    })
}

/// Map an `execution_attempts` row selected with `ATTEMPT_COLUMNS`.
fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionAttempt> {
    let status_str: String = row.get(2)?;
    let status: AttemptStatus = status_str
        .parse()
        .map_err(|e: String| conversion_error(&status_str, e))?;
    let executed_at: DateTime<Utc> = parse_ts(&row.get::<_, String>(7)?)?;
    Ok(ExecutionAttempt {
        id: row.get(0)?,
        job_id: JobId::from(row.get::<_, String>(1)?),
        status,
        attempt_number: row.get(3)?,
        response_code: row.get(4)?,
        response_body: row.get(5)?,
        error_message: row.get(6)?,
        executed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn once_def() -> JobDefinition {
        JobDefinition {
            name: "invoice reminder".into(),
            target: WebhookTarget {
                method: HttpMethod::Post,
                url: "https://example.com/hook".into(),
                headers: BTreeMap::from([("X-Token".to_string(), "abc".to_string())]),
                body: json!({"invoice": 42}),
            },
            schedule: Schedule::Once {
                fire_at: NaiveDate::from_ymd_opt(2030, 1, 1)
                    .unwrap()
                    .and_hms_opt(9, 30, 0)
                    .unwrap(),
            },
            timezone: "Europe/Rome".into(),
            max_retries: 3,
            retry_base_delay_secs: 60,
            timeout_secs: 30,
        }
    }

    fn succeed(store: &SqliteStore, attempt_id: i64, job_id: &JobId, deactivate: bool) {
        let outcome = AttemptOutcome {
            status: AttemptStatus::Success,
            response_code: Some(200),
            response_body: "ok".into(),
            error_message: String::new(),
        };
        store
            .finish_attempt(attempt_id, job_id, &outcome, deactivate)
            .unwrap();
    }

    fn started(claim: AttemptClaim) -> ExecutionAttempt {
        match claim {
            AttemptClaim::Started(a) => a,
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[test]
    fn insert_then_get_roundtrips_every_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.schedule, once_def().schedule);
        assert_eq!(loaded.target, once_def().target);
        assert_eq!(loaded.timezone, "Europe/Rome");
        assert!(loaded.is_active);
        assert!(loaded.dispatch_handle.is_none());
        assert!(loaded.last_execution_at.is_none());
    }

    #[test]
    fn narrow_updates_touch_only_their_column() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let handle = DispatchHandle("h-1".into());
        store.set_dispatch_handle(&job.id, Some(&handle)).unwrap();
        assert!(store.set_active(&job.id, false).unwrap());

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.dispatch_handle, Some(handle));
        assert!(!loaded.is_active);
        assert_eq!(loaded.name, "invoice reminder");
        assert!(!store.set_active(&JobId::new(), true).unwrap());
    }

    #[test]
    fn replace_definition_switches_schedule_kind_and_clears_handles() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        store
            .set_dispatch_handle(&job.id, Some(&DispatchHandle("h".into())))
            .unwrap();

        let mut def = once_def();
        def.schedule = Schedule::Recurring {
            cron_expression: "0 * * * *".into(),
        };
        assert!(store.replace_definition(&job.id, &def).unwrap());

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.kind(), ScheduleKind::Recurring);
        assert!(loaded.dispatch_handle.is_none());
    }

    #[test]
    fn begin_attempt_skips_missing_and_inactive_jobs() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(
            store.begin_attempt(&JobId::new(), 1).unwrap(),
            AttemptClaim::NotFound
        );
        let job = store.insert_job(&once_def()).unwrap();
        store.set_active(&job.id, false).unwrap();
        assert_eq!(
            store.begin_attempt(&job.id, 1).unwrap(),
            AttemptClaim::Inactive
        );
        assert!(store.list_attempts(&job.id).unwrap().is_empty());
    }

    #[test]
    fn once_job_guard_blocks_after_success_and_deactivates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let attempt = started(store.begin_attempt(&job.id, 1).unwrap());
        // Deliberately leave the job active to exercise the guard itself.
        succeed(&store, attempt.id, &job.id, false);
        assert!(store.exists_success_attempt(&job.id).unwrap());

        assert_eq!(
            store.begin_attempt(&job.id, 1).unwrap(),
            AttemptClaim::AlreadySucceeded
        );
        assert!(!store.get_job(&job.id).unwrap().unwrap().is_active);
        assert_eq!(store.list_attempts(&job.id).unwrap().len(), 1);
    }

    #[test]
    fn once_job_duplicate_delivery_in_flight_is_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        started(store.begin_attempt(&job.id, 1).unwrap());
        assert_eq!(
            store.begin_attempt(&job.id, 1).unwrap(),
            AttemptClaim::InFlight
        );
    }

    #[test]
    fn recurring_job_allows_repeated_first_attempts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut def = once_def();
        def.schedule = Schedule::Recurring {
            cron_expression: "*/5 * * * *".into(),
        };
        let job = store.insert_job(&def).unwrap();
        let first = started(store.begin_attempt(&job.id, 1).unwrap());
        succeed(&store, first.id, &job.id, false);
        started(store.begin_attempt(&job.id, 1).unwrap());
        assert_eq!(store.list_attempts(&job.id).unwrap().len(), 2);
    }

    #[test]
    fn finish_attempt_stamps_job_and_can_deactivate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let attempt = started(store.begin_attempt(&job.id, 1).unwrap());
        succeed(&store, attempt.id, &job.id, true);

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert!(!loaded.is_active);
        assert!(loaded.last_execution_at.is_some());
        let attempts = store.list_attempts(&job.id).unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert_eq!(attempts[0].response_code, Some(200));
        assert_eq!(attempts[0].response_body, "ok");
    }

    #[test]
    fn attempts_are_listed_newest_first_and_cascade_on_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        for n in 1..=3 {
            let a = started(store.begin_attempt(&job.id, n).unwrap());
            store.mark_retrying(a.id).unwrap();
        }
        let numbers: Vec<u32> = store
            .list_attempts(&job.id)
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);

        assert!(store.delete_job(&job.id).unwrap());
        assert!(store.list_attempts(&job.id).unwrap().is_empty());
        assert!(!store.delete_job(&job.id).unwrap());
    }

    #[test]
    fn abandoned_pending_attempt_is_reclaimed_after_timeout() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let stuck = started(store.begin_attempt(&job.id, 1).unwrap());

        // Older than timeout (30 s) plus the grace period.
        let long_ago = Utc::now() - Duration::seconds(30 + STALE_ATTEMPT_GRACE_SECS as i64 + 5);
        store
            .conn()
            .execute(
                "UPDATE execution_attempts SET executed_at = ?1 WHERE id = ?2",
                rusqlite::params![fmt_ts(long_ago), stuck.id],
            )
            .unwrap();

        let retry = started(store.begin_attempt(&job.id, 1).unwrap());
        assert_ne!(retry.id, stuck.id);

        let attempts = store.list_attempts(&job.id).unwrap();
        let old = attempts.iter().find(|a| a.id == stuck.id).unwrap();
        assert_eq!(old.status, AttemptStatus::Failed);
        assert_eq!(old.error_message, ABANDONED_ATTEMPT_MESSAGE);
    }

    #[test]
    fn oversized_durations_are_rejected_not_wrapped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut def = once_def();
        def.retry_base_delay_secs = u64::MAX;
        let err = store.insert_job(&def).unwrap_err();
        assert!(err.is_validation(), "got {err:?}");

        let job = store.insert_job(&once_def()).unwrap();
        let mut def = once_def();
        def.timeout_secs = u64::MAX;
        assert!(store.replace_definition(&job.id, &def).unwrap_err().is_validation());
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().timeout_secs, 30);
    }

    #[test]
    fn list_jobs_applies_each_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        let once = store.insert_job(&once_def()).unwrap();
        let mut def = once_def();
        def.schedule = Schedule::Recurring {
            cron_expression: "0 * * * *".into(),
        };
        def.target.method = HttpMethod::Get;
        let recurring = store.insert_job(&def).unwrap();
        store.set_active(&recurring.id, false).unwrap();

        let ids = |filter: JobFilter| -> Vec<JobId> {
            let jobs = store.list_jobs(&filter).unwrap();
            assert!(jobs.iter().all(|j| filter.matches(j)));
            jobs.into_iter().map(|j| j.id).collect()
        };
        assert_eq!(ids(JobFilter::default()).len(), 2);
        assert_eq!(
            ids(JobFilter {
                schedule_kind: Some(ScheduleKind::Recurring),
                ..Default::default()
            }),
            vec![recurring.id.clone()]
        );
        assert_eq!(
            ids(JobFilter {
                is_active: Some(true),
                ..Default::default()
            }),
            vec![once.id.clone()]
        );
        assert_eq!(
            ids(JobFilter {
                method: Some(HttpMethod::Get),
                is_active: Some(true),
                ..Default::default()
            }),
            Vec::<JobId>::new()
        );
    }

    #[test]
    fn attempt_pages_and_summaries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = store.insert_job(&once_def()).unwrap();
        let idle = store.insert_job(&once_def()).unwrap();
        for n in 1..=3 {
            let a = started(store.begin_attempt(&job.id, n).unwrap());
            store.mark_retrying(a.id).unwrap();
        }
        let last = started(store.begin_attempt(&job.id, 4).unwrap());
        succeed(&store, last.id, &job.id, false);

        let page: Vec<u32> = store
            .list_attempts_page(&job.id, Page::new(2, 1))
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(page, vec![3, 2]);
        assert!(store
            .list_attempts_page(&job.id, Page::new(10, 4))
            .unwrap()
            .is_empty());

        let all = store.execution_summaries(None).unwrap();
        assert_eq!(
            all.get(&job.id),
            Some(&ExecutionSummary {
                execution_count: 4,
                last_execution_status: Some(AttemptStatus::Success),
            })
        );
        assert!(!all.contains_key(&idle.id));

        let one = store.execution_summaries(Some(&idle.id)).unwrap();
        assert!(one.is_empty());
    }
}
