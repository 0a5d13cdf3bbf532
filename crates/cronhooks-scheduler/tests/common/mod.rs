// Shared fakes for the engine integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use cronhooks_core::JobId;
use rusqlite::{Connection, OpenFlags};
use cronhooks_scheduler::caller::CallResponse;
use cronhooks_scheduler::types::{DispatchHandle, TriggerId};
use cronhooks_scheduler::{
    DispatchError, DispatchGateway, ExecutionFailure, Executor, HttpMethod, JobDefinition,
    PeriodicTrigger, Schedule, SqliteStore, WebhookCaller, WebhookScheduler, WebhookStore,
    WebhookTarget,
};

/// One recorded enqueue call.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job_id: JobId,
    pub attempt_number: u32,
    pub at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
    pub handle: DispatchHandle,
}

/// Gateway that records every call instead of queueing anything.
#[derive(Default)]
pub struct RecordingGateway {
    pub enqueued: Mutex<Vec<Enqueued>>,
    pub revoked: Mutex<Vec<DispatchHandle>>,
    /// job -> (trigger, enabled)
    pub periodic: Mutex<HashMap<JobId, (TriggerId, bool)>>,
    pub fail_enqueue_after: AtomicBool,
    next_handle: AtomicUsize,
}

impl RecordingGateway {
    fn record(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        at: Option<DateTime<Utc>>,
        delay: Option<Duration>,
    ) -> DispatchHandle {
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = DispatchHandle(format!("handle-{n}"));
        self.enqueued.lock().unwrap().push(Enqueued {
            job_id: job_id.clone(),
            attempt_number,
            at,
            delay,
            handle: handle.clone(),
        });
        handle
    }

    pub fn enqueued_for(&self, job_id: &JobId) -> Vec<Enqueued> {
        self.enqueued
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn periodic_for(&self, job_id: &JobId) -> Option<(TriggerId, bool)> {
        self.periodic.lock().unwrap().get(job_id).copied()
    }
}

#[async_trait]
impl DispatchGateway for RecordingGateway {
    async fn enqueue_at(
        &self,
        job_id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DispatchHandle, DispatchError> {
        Ok(self.record(job_id, 1, Some(at), None))
    }

    async fn enqueue_now(
        &self,
        job_id: &JobId,
        attempt_number: u32,
    ) -> Result<DispatchHandle, DispatchError> {
        Ok(self.record(job_id, attempt_number, None, Some(Duration::ZERO)))
    }

    async fn enqueue_after(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        delay: Duration,
    ) -> Result<DispatchHandle, DispatchError> {
        if self.fail_enqueue_after.load(Ordering::SeqCst) {
            return Err(DispatchError::InvalidCadence("broker unavailable".into()));
        }
        Ok(self.record(job_id, attempt_number, None, Some(delay)))
    }

    async fn revoke(&self, handle: &DispatchHandle) -> Result<(), DispatchError> {
        self.revoked.lock().unwrap().push(handle.clone());
        Ok(())
    }

    async fn register_periodic(
        &self,
        job_id: &JobId,
        trigger: &PeriodicTrigger,
        enabled: bool,
    ) -> Result<(), DispatchError> {
        self.periodic
            .lock()
            .unwrap()
            .insert(job_id.clone(), (trigger.id, enabled));
        Ok(())
    }

    async fn set_periodic_enabled(
        &self,
        job_id: &JobId,
        trigger_id: TriggerId,
        enabled: bool,
    ) -> Result<(), DispatchError> {
        let mut periodic = self.periodic.lock().unwrap();
        match periodic.get_mut(job_id) {
            Some(entry) if entry.0 == trigger_id => {
                entry.1 = enabled;
                Ok(())
            }
            _ => Err(DispatchError::UnknownBinding(job_id.clone())),
        }
    }

    async fn remove_periodic(&self, job_id: &JobId) -> Result<(), DispatchError> {
        match self.periodic.lock().unwrap().remove(job_id) {
            Some(_) => Ok(()),
            None => Err(DispatchError::UnknownBinding(job_id.clone())),
        }
    }
}

/// Caller that replays scripted results, repeating the last one forever.
pub struct ScriptedCaller {
    script: Mutex<VecDeque<Result<CallResponse, ExecutionFailure>>>,
    last: Mutex<Result<CallResponse, ExecutionFailure>>,
    latency: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedCaller {
    pub fn always_status(status: u16) -> Self {
        Self::sequence(vec![Ok(response(status))])
    }

    pub fn sequence(results: Vec<Result<CallResponse, ExecutionFailure>>) -> Self {
        let last = results
            .last()
            .cloned()
            .unwrap_or_else(|| Ok(response(200)));
        Self {
            script: Mutex::new(results.into()),
            last: Mutex::new(last),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn response(status: u16) -> CallResponse {
    CallResponse {
        status,
        body: format!("status {status}"),
    }
}

#[async_trait]
impl WebhookCaller for ScriptedCaller {
    async fn call(
        &self,
        _target: &WebhookTarget,
        _timeout_secs: u64,
    ) -> Result<CallResponse, ExecutionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self.last.lock().unwrap().clone(),
        }
    }
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<RecordingGateway>,
    pub caller: Arc<ScriptedCaller>,
    pub scheduler: WebhookScheduler,
    pub executor: Arc<Executor>,
}

pub fn harness(caller: ScriptedCaller) -> Harness {
    harness_with_store(SqliteStore::open_in_memory().unwrap(), caller)
}

pub fn harness_with_store(store: SqliteStore, caller: ScriptedCaller) -> Harness {
    let store = Arc::new(store);
    let gateway = Arc::new(RecordingGateway::default());
    let caller = Arc::new(caller);
    let dyn_store: Arc<dyn WebhookStore> = store.clone();
    let dyn_gateway: Arc<dyn DispatchGateway> = gateway.clone();
    let scheduler = WebhookScheduler::new(dyn_store.clone(), dyn_gateway.clone());
    let executor = Arc::new(Executor::new(dyn_store, dyn_gateway, caller.clone()));
    Harness {
        store,
        gateway,
        caller,
        scheduler,
        executor,
    }
}

/// Whole-second wall clock `minutes` from now in UTC.
pub fn in_minutes(minutes: i64) -> NaiveDateTime {
    let t = (Utc::now() + ChronoDuration::minutes(minutes)).naive_utc();
    t.with_nanosecond(0).unwrap()
}

pub fn once_job(url: &str, fire_at: NaiveDateTime) -> JobDefinition {
    JobDefinition {
        name: "send invoice".into(),
        target: WebhookTarget {
            method: HttpMethod::Post,
            url: url.into(),
            headers: BTreeMap::new(),
            body: serde_json::json!({"invoice": 7}),
        },
        schedule: Schedule::Once { fire_at },
        timezone: "UTC".into(),
        max_retries: 3,
        retry_base_delay_secs: 60,
        timeout_secs: 30,
    }
}

pub fn recurring_job(url: &str, cron: &str, timezone: &str) -> JobDefinition {
    JobDefinition {
        name: "poll feed".into(),
        target: WebhookTarget {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: serde_json::Value::Null,
        },
        schedule: Schedule::Recurring {
            cron_expression: cron.into(),
        },
        timezone: timezone.into(),
        max_retries: 3,
        retry_base_delay_secs: 60,
        timeout_secs: 30,
    }
}

/// Store over a shared in-memory database whose `success` status updates are
/// aborted by a trigger, so recording a delivered attempt fails.
pub fn store_rejecting_success() -> SqliteStore {
    let uri = format!("file:rejecting-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI;
    let store = SqliteStore::new(Connection::open_with_flags(&uri, flags).unwrap()).unwrap();
    let side = Connection::open_with_flags(&uri, flags).unwrap();
    side.execute_batch(
        "CREATE TRIGGER reject_success BEFORE UPDATE OF status ON execution_attempts
         WHEN NEW.status = 'success'
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();
    store
}
