//! Time math: timezone normalisation, cron parsing and backoff.
//!
//! Everything here is pure so the planner, the registry and the local queue
//! agree on how a schedule maps to UTC instants.

use chrono::{
    DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::types::DEFAULT_TIMEZONE;

/// Wire formats accepted for a naive wall-clock fire time.
const WALL_CLOCK_INPUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Look up an IANA zone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

fn is_utc(timezone: &str) -> bool {
    timezone.is_empty() || timezone == DEFAULT_TIMEZONE
}

/// Parse a client-supplied fire time into a wall-clock timestamp.
///
/// An embedded offset (`...+02:00`, `...Z`) is dropped: the job's declared
/// timezone is what gives the wall clock its meaning. Sub-second precision is
/// truncated.
pub fn parse_wall_clock(input: &str) -> Result<NaiveDateTime> {
    let input = input.trim();
    let naive = DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| {
            WALL_CLOCK_INPUTS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        })
        .ok_or_else(|| SchedulerError::InvalidJob(format!("unrecognised datetime: {input}")))?;
    Ok(naive.with_nanosecond(0).unwrap_or(naive))
}

/// Resolve a wall-clock fire time in `timezone` to the UTC instant it denotes.
///
/// DST edges: an ambiguous time (clocks fall back) takes the later, standard
/// time instant; a skipped time (clocks spring forward) is read with the
/// offset in force before the gap, so it lands just after the transition.
pub fn resolve_fire_at(fire_at: NaiveDateTime, timezone: &str) -> Result<DateTime<Utc>> {
    if is_utc(timezone) {
        return Ok(Utc.from_utc_datetime(&fire_at));
    }
    let tz = parse_timezone(timezone)?;
    let instant = match tz.from_local_datetime(&fire_at) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(_, latest) => latest.with_timezone(&Utc),
        LocalResult::None => {
            // Transitions are never less than a day apart.
            let before_gap = tz
                .offset_from_utc_datetime(&(fire_at - Duration::days(1)))
                .fix();
            let utc = fire_at - Duration::seconds(i64::from(before_gap.local_minus_utc()));
            Utc.from_utc_datetime(&utc)
        }
    };
    Ok(instant)
}

/// The five fields of a standard cron expression.
///
/// Together with a timezone this is the dedup key of a periodic trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CronFields {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

impl CronFields {
    /// Split and validate a five-field expression. Seconds fields and `@macros`
    /// are rejected.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = parts.as_slice() else {
            return Err(SchedulerError::InvalidCron(format!(
                "{expression:?}: expected 5 fields, got {}",
                parts.len()
            )));
        };
        let fields = Self {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: day_of_month.to_string(),
            month: month.to_string(),
            day_of_week: day_of_week.to_string(),
        };
        fields.compile()?;
        Ok(fields)
    }

    /// Canonical single-spaced expression.
    pub fn expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }

    fn compile(&self) -> Result<Cron> {
        let expression = self.expression();
        Cron::new(&expression)
            .parse()
            .map_err(|e| SchedulerError::InvalidCron(format!("{expression:?}: {e}")))
    }

    /// First fire instant strictly after `after`, evaluated on the wall clock of `tz`.
    pub fn next_after(&self, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let cron = self.compile()?;
        cron.find_next_occurrence(&after.with_timezone(&tz), false)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SchedulerError::InvalidCron(format!("{}: {e}", self.expression())))
    }
}

/// Preview the next `count` fire instants of a cadence.
pub fn next_fire_times(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let fields = CronFields::parse(expression)?;
    let tz = parse_timezone(if is_utc(timezone) { DEFAULT_TIMEZONE } else { timezone })?;
    let mut runs = Vec::with_capacity(count);
    let mut cursor = after;
    for _ in 0..count {
        cursor = fields.next_after(tz, cursor)?;
        runs.push(cursor);
    }
    Ok(runs)
}

/// Seconds to wait before the attempt after `failed_attempt`.
///
/// `base * 2^(failed_attempt - 1)`, saturating instead of overflowing.
pub fn retry_delay_secs(base_delay_secs: u64, failed_attempt: u32) -> u64 {
    let exponent = failed_attempt.saturating_sub(1);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_delay_secs.saturating_mul(factor)
}
