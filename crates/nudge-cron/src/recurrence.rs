//! Recurrence calculator: cron expression + base time → next fire time(s).
//!
//! Everything here is pure: no I/O and no clock reads beyond the `base`
//! argument. Times are UTC.
//!
//! Accepted forms:
//! - 5 fields, classic crontab: `min hour day-of-month month day-of-week`
//!   (day-of-week 0-7, Sunday = 0 or 7). Normalized to the 6-field form
//!   with a leading `0` seconds field. When both day fields are restricted
//!   (neither starts with `*` or `?`), a time matches if EITHER day field
//!   matches, as in crontab.
//! - 6 or 7 fields (`sec min hour dom month dow [year]`), passed to the
//!   parser as-is. Day-of-week numbering there is 1-7, Sunday = 1.
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecurrenceError {
    #[error("invalid cron expression '{expr}': {reason}")]
    Invalid { expr: String, reason: String },
    #[error("cron expression '{0}' has no occurrence after the given time")]
    Exhausted(String),
}

fn invalid(expr: &str, reason: impl Into<String>) -> RecurrenceError {
    RecurrenceError::Invalid {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Syntactic validity only; a valid expression may still never fire again.
pub fn validate(expr: &str) -> bool {
    parse(expr).is_ok()
}

/// A parsed expression: one schedule, or two when crontab day matching is a
/// union of day-of-month and day-of-week.
#[derive(Debug, Clone)]
pub struct Recurrence {
    schedules: Vec<Schedule>,
}

impl Recurrence {
    /// Matching times strictly after `base`, ascending and without repeats.
    pub fn after(&self, base: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let mut upcoming: Vec<_> = self
            .schedules
            .iter()
            .map(|schedule| schedule.after(&base).peekable())
            .collect();
        std::iter::from_fn(move || {
            let next = upcoming
                .iter_mut()
                .filter_map(|times| times.peek().copied())
                .min()?;
            for times in upcoming.iter_mut() {
                if times.peek() == Some(&next) {
                    times.next();
                }
            }
            Some(next)
        })
    }
}

/// Parse an expression in any accepted form.
pub fn parse(expr: &str) -> Result<Recurrence, RecurrenceError> {
    let schedules = normalize(expr)?
        .iter()
        .map(|normalized| {
            Schedule::from_str(normalized).map_err(|e| invalid(expr, e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Recurrence { schedules })
}

/// Smallest time strictly after `base` matching `expr`.
pub fn next_fire_time(expr: &str, base: DateTime<Utc>) -> Result<DateTime<Utc>, RecurrenceError> {
    parse(expr)?
        .after(base)
        .next()
        .ok_or_else(|| RecurrenceError::Exhausted(expr.to_string()))
}

/// The next `n` times after `base`. May return fewer if the expression runs out.
pub fn next_n_fire_times(
    expr: &str,
    base: DateTime<Utc>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>, RecurrenceError> {
    Ok(parse(expr)?.after(base).take(n).collect())
}

/// Rewrite an expression into the form(s) the parser understands.
fn normalize(expr: &str) -> Result<Vec<String>, RecurrenceError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.as_slice() {
        [] => Err(invalid(expr, "empty expression")),
        [alias] if alias.starts_with('@') => Ok(vec![alias.to_string()]),
        [minute, hour, dom, month, dow] => {
            let dow = translate_day_of_week(expr, dow)?;
            if is_restricted(dom) && is_restricted(&dow) {
                Ok(vec![
                    format!("0 {minute} {hour} {dom} {month} *"),
                    format!("0 {minute} {hour} * {month} {dow}"),
                ])
            } else {
                Ok(vec![format!("0 {minute} {hour} {dom} {month} {dow}")])
            }
        }
        fields if fields.len() == 6 || fields.len() == 7 => Ok(vec![fields.join(" ")]),
        fields => Err(invalid(
            expr,
            format!("expected 5, 6 or 7 fields, got {}", fields.len()),
        )),
    }
}

/// Crontab treats a day field as unrestricted when it starts with `*`.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

/// Map crontab day-of-week numbers (0-7, Sunday = 0/7) onto the parser's
/// 1-7 numbering (Sunday = 1). Numeric ranges and steps are expanded into
/// explicit lists; day names pass through untouched.
fn translate_day_of_week(expr: &str, field: &str) -> Result<String, RecurrenceError> {
    let mut days: Vec<String> = Vec::new();
    let mut push = |day: String| {
        if !days.contains(&day) {
            days.push(day);
        }
    };

    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| invalid(expr, format!("bad day-of-week step '{step}'")))?;
                if step == 0 {
                    return Err(invalid(expr, "day-of-week step must be positive"));
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let range = match (base, step) {
            ("*" | "?", None) => {
                push(base.to_string());
                continue;
            }
            ("*" | "?", Some(_)) => Some((0, 6)),
            _ => match base.split_once('-') {
                Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
                    (Ok(start), Ok(end)) => Some((start, end)),
                    _ => None,
                },
                None => base
                    .parse::<u8>()
                    .ok()
                    .map(|day| if step.is_some() { (day, 6) } else { (day, day) }),
            },
        };

        let Some((start, end)) = range else {
            push(part.to_string());
            continue;
        };
        if start > 7 || end > 7 || start > end {
            return Err(invalid(expr, format!("day-of-week '{part}' out of range")));
        }
        for day in (start..=end).step_by(usize::from(step.unwrap_or(1))) {
            push(((day % 7) + 1).to_string());
        }
    }

    Ok(days.join(","))
}
