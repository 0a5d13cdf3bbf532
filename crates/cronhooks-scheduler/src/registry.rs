//! Periodic-schedule registry.
//!
//! A trigger is identified by its five cron fields plus a timezone. Jobs that
//! share a cadence share one trigger row; `enabled` is derived from whether
//! any active job still points at it, so cancelling one owner never silences
//! another.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::{fmt_ts, parse_ts};
use crate::error::Result;
use crate::schedule::CronFields;
use crate::store::SqliteStore;
use crate::types::TriggerId;

/// A deduplicated periodic cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTrigger {
    pub id: TriggerId,
    pub fields: CronFields,
    pub timezone: String,
    /// True while at least one active job references this trigger.
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

pub trait TriggerRegistry: Send + Sync {
    /// Return the trigger for `(fields, timezone)`, creating it if absent.
    /// Registering the same cadence twice yields the same trigger.
    fn register_or_reuse(&self, fields: &CronFields, timezone: &str) -> Result<PeriodicTrigger>;

    fn get_trigger(&self, id: TriggerId) -> Result<Option<PeriodicTrigger>>;

    /// Recompute `enabled` from the jobs bound to the trigger and return it.
    fn refresh_enabled(&self, id: TriggerId) -> Result<bool>;

    fn list_triggers(&self) -> Result<Vec<PeriodicTrigger>>;
}

const TRIGGER_COLUMNS: &str =
    "id, minute, hour, day_of_month, month, day_of_week, timezone, enabled, created_at";

impl TriggerRegistry for SqliteStore {
    #[instrument(skip(self, fields), fields(cron = %fields.expression()))]
    fn register_or_reuse(&self, fields: &CronFields, timezone: &str) -> Result<PeriodicTrigger> {
        let db = self.conn();
        let inserted = db.execute(
            "INSERT INTO periodic_triggers
             (minute, hour, day_of_month, month, day_of_week, timezone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (minute, hour, day_of_month, month, day_of_week, timezone) DO NOTHING",
            rusqlite::params![
                fields.minute,
                fields.hour,
                fields.day_of_month,
                fields.month,
                fields.day_of_week,
                timezone,
                fmt_ts(Utc::now()),
            ],
        )?;
        let trigger = db.query_row(
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM periodic_triggers
                 WHERE minute = ?1 AND hour = ?2 AND day_of_month = ?3
                   AND month = ?4 AND day_of_week = ?5 AND timezone = ?6"
            ),
            rusqlite::params![
                fields.minute,
                fields.hour,
                fields.day_of_month,
                fields.month,
                fields.day_of_week,
                timezone,
            ],
            row_to_trigger,
        )?;
        debug!(trigger_id = trigger.id, reused = inserted == 0, "periodic trigger resolved");
        Ok(trigger)
    }

    fn get_trigger(&self, id: TriggerId) -> Result<Option<PeriodicTrigger>> {
        let trigger = self
            .conn()
            .query_row(
                &format!("SELECT {TRIGGER_COLUMNS} FROM periodic_triggers WHERE id = ?1"),
                [id],
                row_to_trigger,
            )
            .optional()?;
        Ok(trigger)
    }

    fn refresh_enabled(&self, id: TriggerId) -> Result<bool> {
        let db = self.conn();
        db.execute(
            "UPDATE periodic_triggers
             SET enabled = EXISTS (SELECT 1 FROM jobs WHERE periodic_handle = ?1 AND is_active = 1)
             WHERE id = ?1",
            [id],
        )?;
        let enabled = db
            .query_row(
                "SELECT enabled FROM periodic_triggers WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(false);
        Ok(enabled)
    }

    fn list_triggers(&self) -> Result<Vec<PeriodicTrigger>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM periodic_triggers ORDER BY id"
        ))?;
        let triggers = stmt
            .query_map([], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }
}

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeriodicTrigger> {
    Ok(PeriodicTrigger {
        id: row.get(0)?,
        fields: CronFields {
            minute: row.get(1)?,
            hour: row.get(2)?,
            day_of_month: row.get(3)?,
            month: row.get(4)?,
            day_of_week: row.get(5)?,
        },
        timezone: row.get(6)?,
        enabled: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStore;
    use crate::types::{HttpMethod, JobDefinition, Schedule, WebhookTarget};

    fn recurring(store: &SqliteStore, cron: &str) -> cronhooks_core::JobId {
        let def = JobDefinition {
            name: "poll".into(),
            target: WebhookTarget {
                method: HttpMethod::Get,
                url: "https://example.com".into(),
                headers: Default::default(),
                body: serde_json::Value::Null,
            },
            schedule: Schedule::Recurring {
                cron_expression: cron.into(),
            },
            timezone: "UTC".into(),
            max_retries: 3,
            retry_base_delay_secs: 60,
            timeout_secs: 30,
        };
        store.insert_job(&def).unwrap().id
    }

    #[test]
    fn same_cadence_reuses_one_trigger() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fields = CronFields::parse("*/5 * * * *").unwrap();
        let a = store.register_or_reuse(&fields, "UTC").unwrap();
        let b = store.register_or_reuse(&fields, "UTC").unwrap();
        assert_eq!(a.id, b.id);
        assert!(!a.enabled);

        let other_zone = store.register_or_reuse(&fields, "Europe/Paris").unwrap();
        assert_ne!(a.id, other_zone.id);
        assert_eq!(store.list_triggers().unwrap().len(), 2);
    }

    #[test]
    fn enabled_tracks_active_owners() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fields = CronFields::parse("*/5 * * * *").unwrap();
        let trigger = store.register_or_reuse(&fields, "UTC").unwrap();

        let first = recurring(&store, "*/5 * * * *");
        let second = recurring(&store, "*/5 * * * *");
        store.set_periodic_handle(&first, Some(trigger.id)).unwrap();
        store.set_periodic_handle(&second, Some(trigger.id)).unwrap();
        assert!(store.refresh_enabled(trigger.id).unwrap());

        store.set_active(&first, false).unwrap();
        assert!(store.refresh_enabled(trigger.id).unwrap());

        store.set_active(&second, false).unwrap();
        assert!(!store.refresh_enabled(trigger.id).unwrap());
        assert!(!store.get_trigger(trigger.id).unwrap().unwrap().enabled);
    }

    #[test]
    fn refresh_of_unknown_trigger_is_disabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.refresh_enabled(999).unwrap());
        assert!(store.get_trigger(999).unwrap().is_none());
    }
}
