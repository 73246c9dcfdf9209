//! Key duration parsing.
//!
//! Durations are stored as interval text, e.g. `"30 days"`, `"1 month"`,
//! `"1 day 12:00:00"` or the compact `"7d"`. A month is 30 days and a year
//! 365 days.

use thiserror::Error;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const YEAR: i64 = 365 * DAY;

/// Longest duration a key may carry.
pub const MAX_INTERVAL: i64 = 100 * YEAR;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("empty interval")]
    Empty,

    #[error("invalid number {0:?}")]
    Number(String),

    #[error("unknown unit {0:?}")]
    Unit(String),

    #[error("missing unit after {0}")]
    MissingUnit(i64),

    #[error("invalid clock value {0:?}")]
    Clock(String),

    #[error("interval must be positive")]
    NotPositive,

    #[error("interval overflows")]
    Overflow,

    #[error("interval is longer than 100 years")]
    TooLong,
}

/// Parse an interval string into whole seconds.
pub fn parse_interval(input: &str) -> Result<i64, IntervalError> {
    let mut tokens = input.split_whitespace().peekable();
    if tokens.peek().is_none() {
        return Err(IntervalError::Empty);
    }

    let mut total: i64 = 0;
    while let Some(token) = tokens.next() {
        let secs = if token.contains(':') {
            parse_clock(token)?
        } else {
            let split = token
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(token.len());
            let (digits, attached_unit) = token.split_at(split);
            let amount: i64 = digits
                .parse()
                .map_err(|_| IntervalError::Number(token.to_string()))?;

            let unit = if attached_unit.is_empty() {
                tokens.next().ok_or(IntervalError::MissingUnit(amount))?
            } else {
                attached_unit
            };

            amount
                .checked_mul(unit_seconds(unit)?)
                .ok_or(IntervalError::Overflow)?
        };
        total = total.checked_add(secs).ok_or(IntervalError::Overflow)?;
    }

    if total <= 0 {
        return Err(IntervalError::NotPositive);
    }
    if total > MAX_INTERVAL {
        return Err(IntervalError::TooLong);
    }
    Ok(total)
}

fn unit_seconds(unit: &str) -> Result<i64, IntervalError> {
    let secs = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "w" | "week" | "weeks" => 7 * DAY,
        "mon" | "mons" | "month" | "months" => 30 * DAY,
        "y" | "yr" | "yrs" | "year" | "years" => YEAR,
        _ => return Err(IntervalError::Unit(unit.to_string())),
    };
    Ok(secs)
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_clock(token: &str) -> Result<i64, IntervalError> {
    let parts: Vec<&str> = token.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(IntervalError::Clock(token.to_string()));
    }

    let mut values = [0i64; 3];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| IntervalError::Clock(token.to_string()))?;
    }
    let [hours, minutes, seconds] = values;
    if !(0..60).contains(&minutes) || !(0..60).contains(&seconds) || hours < 0 {
        return Err(IntervalError::Clock(token.to_string()));
    }

    hours
        .checked_mul(HOUR)
        .and_then(|h| h.checked_add(minutes * MINUTE + seconds))
        .ok_or(IntervalError::Overflow)
}
