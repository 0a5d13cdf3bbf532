//! `cronhooks-scheduler` - scheduled webhook engine with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted in a SQLite `jobs` table. The [`planner::Planner`]
//! turns a job's schedule into queue state: a deferred dispatch for one-time
//! jobs, or a binding to a shared periodic trigger for recurring ones. The
//! [`engine::QueueEngine`] polls the [`queue::LocalQueue`] and hands each
//! due delivery to the [`executor::Executor`], which performs the HTTP call,
//! records an attempt and schedules retries with exponential backoff.
//!
//! # Schedule kinds
//!
//! | Kind        | Declared as                       | Queue state                       |
//! |-------------|-----------------------------------|-----------------------------------|
//! | `once`      | wall-clock time + IANA timezone   | one deferred dispatch (handle)    |
//! | `recurring` | 5-field cron + IANA timezone      | binding to a deduplicated trigger |

pub mod caller;
pub mod controller;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use caller::{ReqwestCaller, WebhookCaller};
pub use engine::QueueEngine;
pub use error::{DispatchError, ExecutionFailure, Result, SchedulerError};
pub use executor::{ExecutionReport, Executor, SkipReason};
pub use gateway::{Delivery, DispatchGateway};
pub use queue::LocalQueue;
pub use registry::{PeriodicTrigger, TriggerRegistry};
pub use service::WebhookScheduler;
pub use store::{AttemptStore, JobStore, SqliteStore, WebhookStore};
pub use types::{
    AttemptStatus, ExecutionAttempt, ExecutionSummary, HttpMethod, Job, JobDefinition, JobFilter,
    Page, Schedule, ScheduleKind, WebhookTarget,
};
