//! Scheduled jobs: cron-triggered templates that materialize into
//! concrete jobs.
//!
//! While a scheduled job is Active the coordinator's cron scheduler
//! fires it at most once per tick; ticks missed while the coordinator
//! was down are not backfilled.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::task::Task;

/// Whether the cron entry currently fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledJobState {
    #[default]
    Active,
    Paused,
}

/// A cron-triggered job template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub state: ScheduledJobState,
    /// Standard 5-field cron expression (a seconds field is prepended
    /// internally).
    pub cron: String,
    /// Optional fixed UTC offset (`"+02:00"`, `"-05:30"`) the cron
    /// expression is evaluated in. Empty means UTC.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,

    // The job template, copied verbatim into each materialized job.
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
}

/// Parse a cron expression into a [`cron::Schedule`]. Standard
/// 5-field user input is normalized by prepending a `0` seconds field.
pub fn cron_schedule(expr: &str) -> Result<cron::Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    normalized
        .parse::<cron::Schedule>()
        .map_err(|e| CoreError::InvalidValue {
            what: "cron expression",
            reason: e.to_string(),
        })
}

/// Parse a fixed-offset timezone of the form `+HH:MM` / `-HH:MM`.
pub fn parse_fixed_offset(tz: &str) -> Result<FixedOffset> {
    let err = || CoreError::InvalidValue {
        what: "timezone",
        reason: format!("`{tz}` is not a fixed offset like `+02:00`"),
    };
    let (sign, rest) = match tz.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(err()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(err)?;
    let hours: i32 = hours.parse().map_err(|_| err())?;
    let minutes: i32 = minutes.parse().map_err(|_| err())?;
    if hours > 23 || minutes > 59 {
        return Err(err());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_normalized() {
        cron_schedule("*/5 * * * *").unwrap();
        cron_schedule("0 30 9 * * 1-5").unwrap();
        assert!(cron_schedule("not a cron").is_err());
    }

    #[test]
    fn fixed_offsets_parse() {
        assert_eq!(
            parse_fixed_offset("+02:00").unwrap(),
            FixedOffset::east_opt(7200).unwrap()
        );
        assert_eq!(
            parse_fixed_offset("-05:30").unwrap(),
            FixedOffset::west_opt(5 * 3600 + 1800).unwrap()
        );
        assert!(parse_fixed_offset("UTC").is_err());
        assert!(parse_fixed_offset("+25:00").is_err());
    }

    #[test]
    fn default_state_is_active() {
        let sj: ScheduledJob = serde_json::from_str(
            r#"{"id":"1","name":"nightly","cron":"0 3 * * *","created_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(sj.state, ScheduledJobState::Active);
        assert!(sj.timezone.is_empty());
    }
}
