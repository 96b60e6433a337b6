//! Clock & timezone service: the single place that computes when a trigger
//! fires next. Everything downstream treats the returned instants as opaque.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use croner::Cron;

use crate::error::{CoreError, CoreResult};
use crate::types::TriggerSpec;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Current wall-clock time in an IANA timezone.
pub fn now_in(timezone: &str) -> CoreResult<DateTime<Tz>> {
    let tz = resolve_timezone(timezone)?;
    Ok(Utc::now().with_timezone(&tz))
}

pub fn resolve_timezone(name: &str) -> CoreResult<Tz> {
    name.trim().parse::<Tz>().map_err(|_| {
        CoreError::domain(
            format!("I don't recognize the timezone '{}'.", name),
            format!("unknown timezone: {}", name),
        )
    })
}

/// Validate a trigger without computing anything. Used at task-creation time
/// so malformed specs are rejected before they are persisted.
pub fn validate_trigger(trigger: &TriggerSpec) -> CoreResult<()> {
    match trigger {
        TriggerSpec::Interval { seconds, .. } => {
            if *seconds < 1 {
                return Err(CoreError::domain(
                    "Intervals must be at least one second.",
                    format!("interval below minimum: {}s", seconds),
                ));
            }
            Ok(())
        }
        TriggerSpec::Cron { expr, timezone } => {
            resolve_timezone(timezone)?;
            parse_cron(expr)?;
            Ok(())
        }
        TriggerSpec::DailyAt { at, timezone } => {
            resolve_timezone(timezone)?;
            parse_clock(at)?;
            Ok(())
        }
        TriggerSpec::OneShot { .. } => Ok(()),
    }
}

/// Next instant strictly after `after` at which the trigger fires.
///
/// `Ok(None)` means the trigger has no future occurrence and the task should
/// be disabled (one-shots whose time has passed). DST handling follows the
/// cron engine: non-existent local times are skipped forward, ambiguous
/// fall-back times resolve to the earlier occurrence.
pub fn next_fire(trigger: &TriggerSpec, after: DateTime<Utc>) -> CoreResult<Option<DateTime<Utc>>> {
    match trigger {
        TriggerSpec::Interval { seconds, anchor } => {
            if *seconds < 1 {
                return Err(CoreError::domain(
                    "Intervals must be at least one second.",
                    format!("interval below minimum: {}s", seconds),
                ));
            }
            let anchor = anchor.unwrap_or(after);
            if anchor > after {
                return Ok(Some(anchor));
            }
            // Smallest anchor + k*step strictly greater than `after`.
            let elapsed = (after - anchor).num_seconds();
            let k = elapsed / (*seconds as i64) + 1;
            Ok(Some(anchor + Duration::seconds(k * *seconds as i64)))
        }
        TriggerSpec::Cron { expr, timezone } => {
            let tz = resolve_timezone(timezone)?;
            let cron = parse_cron(expr)?;
            let after_local = after.with_timezone(&tz);
            match cron.find_next_occurrence(&after_local, false) {
                Ok(next) => Ok(Some(next.with_timezone(&Utc))),
                Err(_) => Ok(None),
            }
        }
        TriggerSpec::DailyAt { at, timezone } => {
            let (hour, minute) = parse_clock(at)?;
            let daily = TriggerSpec::Cron {
                expr: format!("{} {} * * *", minute, hour),
                timezone: timezone.clone(),
            };
            next_fire(&daily, after)
        }
        TriggerSpec::OneShot { at } => {
            if *at > after {
                Ok(Some(*at))
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_cron(expr: &str) -> CoreResult<Cron> {
    expr.parse::<Cron>().map_err(|e| {
        CoreError::domain(
            format!("'{}' is not a valid cron expression.", expr),
            format!("invalid cron expression '{}': {}", expr, e),
        )
    })
}

/// Parse "HH:MM" within 00:00-23:59.
pub fn parse_clock(at: &str) -> CoreResult<(u32, u32)> {
    let invalid = || {
        CoreError::domain(
            format!("'{}' is not a valid time. Use HH:MM between 00:00 and 23:59.", at),
            format!("invalid at-time: {}", at),
        )
    };
    let (hour_raw, minute_raw) = at.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour_raw.parse().map_err(|_| invalid())?;
    let minute: u32 = minute_raw.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}
