//! Cron expression parsing.
//!
//! The `cron` crate wants a leading seconds field and numbers weekdays
//! 1 (Sunday) through 7 (Saturday). Classic five-field expressions get `0`
//! prepended and their day-of-week field renumbered from the usual
//! 0/7 = Sunday, 1 = Monday form. Six- and seven-field expressions are
//! already in the crate's dialect and pass through unchanged.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// Rewrite a five-field expression into the `cron` crate's six-field form.
pub fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {minute} {hour} {dom} {month} {}", day_of_week(dow))
        }
        _ => trimmed.to_string(),
    }
}

fn day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| renumber_days(item).unwrap_or_else(|| item.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand one numeric list item (`n`, `a-b`, `a-b/s`, `a/s`) into the
/// crate's day numbers. `None` leaves the item as written: wildcards and
/// names mean the same in both dialects, and anything malformed is left for
/// the parser to reject.
fn renumber_days(item: &str) -> Option<String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };
    let (start, end) = match range.split_once('-') {
        Some((a, b)) => (a.parse::<u32>().ok()?, b.parse::<u32>().ok()?),
        None => {
            let day = range.parse::<u32>().ok()?;
            (day, if step.is_some() { 6 } else { day })
        }
    };
    if start > end || end > 7 {
        return None;
    }
    let mut days: Vec<u32> = (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|day| day % 7 + 1)
        .collect();
    days.sort_unstable();
    days.dedup();
    Some(
        days.iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Parse a 5/6/7-field cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(&normalize(expression)).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`.
pub fn next_after(schedule: &Schedule, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(after).next()
}
