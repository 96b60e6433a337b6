//! Schedule grammar shared by admin commands, the YAML seed overlay, and the
//! natural-language interpreter: a small closed set of interval words plus
//! optional at-time, timezone, and weekday qualifiers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::clock;
use crate::error::{CoreError, CoreResult};
use crate::types::TriggerSpec;

static EVERY_INTERVAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^every_(\d+)_(minutes|hours|days)$").expect("static regex"));

/// Accepted interval words: once | hourly | daily | weekly |
/// every_<N>_minutes | every_<N>_hours | every_<N>_days.
pub fn is_valid_interval(interval: &str) -> bool {
    let value = interval.trim().to_lowercase();
    matches!(value.as_str(), "once" | "hourly" | "daily" | "weekly")
        || EVERY_INTERVAL.is_match(&value)
}

/// Qualifiers that refine an interval word into a concrete trigger.
#[derive(Debug, Clone, Default)]
pub struct ScheduleQualifiers {
    /// "HH:MM" local wall-clock time.
    pub at: Option<String>,
    /// IANA timezone; falls back to the given default.
    pub timezone: Option<String>,
    /// Absolute instant for one-shot tasks.
    pub run_at: Option<DateTime<Utc>>,
    /// Weekdays with Monday = 0, as the interpreter produces them.
    pub weekdays: Vec<u8>,
}

/// Build a trigger from an interval word plus qualifiers. The result is
/// validated; malformed specs never leave this function.
pub fn build_trigger(
    interval: &str,
    qualifiers: &ScheduleQualifiers,
    default_timezone: &str,
) -> CoreResult<TriggerSpec> {
    let interval = interval.trim().to_lowercase();
    let timezone = qualifiers
        .timezone
        .as_deref()
        .unwrap_or(default_timezone)
        .to_string();
    clock::resolve_timezone(&timezone)?;

    let trigger = match interval.as_str() {
        "once" => {
            let at = qualifiers.run_at.ok_or_else(|| {
                CoreError::domain(
                    "A one-time task needs a run time.",
                    "interval 'once' without run_at",
                )
            })?;
            TriggerSpec::OneShot { at }
        }
        "hourly" => TriggerSpec::Interval { seconds: 3600, anchor: None },
        "daily" => match &qualifiers.at {
            Some(at) => {
                if qualifiers.weekdays.is_empty() {
                    TriggerSpec::DailyAt { at: at.clone(), timezone }
                } else {
                    let (hour, minute) = clock::parse_clock(at)?;
                    TriggerSpec::Cron {
                        expr: format!(
                            "{} {} * * {}",
                            minute,
                            hour,
                            cron_day_list(&qualifiers.weekdays)?
                        ),
                        timezone,
                    }
                }
            }
            None => TriggerSpec::Interval { seconds: 86_400, anchor: None },
        },
        "weekly" => {
            let (hour, minute) = match &qualifiers.at {
                Some(at) => clock::parse_clock(at)?,
                None => (9, 0),
            };
            let weekdays = if qualifiers.weekdays.is_empty() {
                vec![0]
            } else {
                qualifiers.weekdays.clone()
            };
            TriggerSpec::Cron {
                expr: format!("{} {} * * {}", minute, hour, cron_day_list(&weekdays)?),
                timezone,
            }
        }
        other => match EVERY_INTERVAL.captures(other) {
            Some(caps) => {
                let count: u64 = caps[1].parse().map_err(|_| {
                    CoreError::domain(
                        "That interval count is out of range.",
                        format!("interval count overflow in '{}'", other),
                    )
                })?;
                if count == 0 {
                    return Err(CoreError::domain(
                        "Intervals must be at least one unit long.",
                        format!("zero-length interval '{}'", other),
                    ));
                }
                let unit_seconds = match &caps[2] {
                    "minutes" => 60,
                    "hours" => 3600,
                    _ => 86_400,
                };
                TriggerSpec::Interval { seconds: count * unit_seconds, anchor: None }
            }
            None => {
                return Err(CoreError::domain(
                    "Use once, hourly, daily, weekly, or every_<N>_minutes|hours|days.",
                    format!("unrecognized interval '{}'", other),
                ))
            }
        },
    };

    clock::validate_trigger(&trigger)?;
    Ok(trigger)
}

/// Monday-based weekday indexes to a cron day-of-week list (Sunday = 0).
fn cron_day_list(weekdays: &[u8]) -> CoreResult<String> {
    let mut days: Vec<u8> = Vec::new();
    for &day in weekdays {
        if day > 6 {
            return Err(CoreError::domain(
                "Weekdays run from 0 (Monday) to 6 (Sunday).",
                format!("weekday {} out of range", day),
            ));
        }
        let cron_day = (day + 1) % 7;
        if !days.contains(&cron_day) {
            days.push(cron_day);
        }
    }
    days.sort_unstable();
    Ok(days
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(","))
}
