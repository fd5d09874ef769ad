//! Comparator mini-language used by rule conditions and templated options.
//!
//! Two forms are understood:
//!
//! - value comparators such as `">100"`, `"<9"`, `"=10"` or a bare `"10"` (exact match),
//!   checked against an integer taken from the token or a counter;
//! - field expressions such as `"last_used=={now}"` or `"expires<{now}+10d"`, where the
//!   literal may reference the current time with an optional `±<N><unit>` offset
//!   (units `s`, `m`, `h`, `d`, `y`).
//!
//! Malformed input never panics or errors out to the caller: it is logged and treated as
//! a non-match.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::cmp::Ordering;
use tracing::warn;

static NOW_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\{now\}(?:\s*([+-])\s*(\d+)\s*([smhdy]))?").ok());

static OFFSET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*([+-]?)\s*(\d+)\s*([smhdy])\s*$").ok());

/// Operator of a field expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    Greater,
    Less,
}

impl Comparator {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Equal => ordering == Ordering::Equal,
            Self::Greater => ordering == Ordering::Greater,
            Self::Less => ordering == Ordering::Less,
        }
    }
}

/// A parsed `<field> <op> <literal>` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpression {
    pub field: String,
    pub comparator: Comparator,
    pub literal: String,
}

/// Lenient boolean parser for condition values and options.
#[must_use]
pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "t" | "yes" | "y" | "on"
    )
}

/// Compare an integer against a value comparator like `">100"` or `"=10"`.
///
/// A bare number is an exact match. Unparseable conditions are logged and never match.
#[must_use]
pub fn compare_condition(condition: &str, value: i64) -> bool {
    let condition = condition.trim();
    let (comparator, number) = match condition.chars().next() {
        Some('>') => (Comparator::Greater, &condition[1..]),
        Some('<') => (Comparator::Less, &condition[1..]),
        Some('=') => (Comparator::Equal, condition.trim_start_matches('=')),
        _ => (Comparator::Equal, condition),
    };

    match number.trim().parse::<i64>() {
        Ok(number) => comparator.holds(value.cmp(&number)),
        Err(err) => {
            warn!("Malformed comparator condition {condition:?}: {err}");
            false
        }
    }
}

/// Split `key==value`, `key>value`, `key<value` (and `key=value` as equality).
///
/// The operator is the first `=`, `>` or `<` found, so literals may contain the other
/// characters freely after it.
#[must_use]
pub fn parse_field_expression(expression: &str) -> Option<FieldExpression> {
    let position = expression.find(['=', '>', '<'])?;
    let field = expression[..position].trim();
    if field.is_empty() {
        return None;
    }

    let rest = &expression[position..];
    let (comparator, literal) = if let Some(literal) = rest.strip_prefix("==") {
        (Comparator::Equal, literal)
    } else if let Some(literal) = rest.strip_prefix('=') {
        (Comparator::Equal, literal)
    } else if let Some(literal) = rest.strip_prefix('>') {
        (Comparator::Greater, literal)
    } else {
        (Comparator::Less, &rest[1..])
    };

    Some(FieldExpression {
        field: field.to_string(),
        comparator,
        literal: literal.trim().to_string(),
    })
}

/// Parse an offset like `+10d`, `-5h` or `30m` into a signed duration.
#[must_use]
pub fn parse_time_offset(offset: &str) -> Option<Duration> {
    let captures = OFFSET_PATTERN.as_ref()?.captures(offset)?;
    let sign = if &captures[1] == "-" { -1 } else { 1 };
    let amount: i64 = captures[2].parse().ok()?;
    unit_duration(&captures[3], sign * amount)
}

fn unit_duration(unit: &str, amount: i64) -> Option<Duration> {
    match unit {
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        "y" => Duration::try_days(amount.checked_mul(365)?),
        _ => None,
    }
}

/// Replace every `{now}` / `{now}±N<unit>` with an RFC 3339 timestamp relative to `now`.
///
/// Offsets that overflow leave the placeholder untouched.
#[must_use]
pub fn substitute_now(template: &str, now: DateTime<Utc>) -> String {
    let Some(pattern) = NOW_PATTERN.as_ref() else {
        return template.to_string();
    };

    pattern
        .replace_all(template, |captures: &Captures<'_>| {
            let shifted = match (captures.get(1), captures.get(2), captures.get(3)) {
                (Some(sign), Some(amount), Some(unit)) => amount
                    .as_str()
                    .parse::<i64>()
                    .ok()
                    .map(|amount| if sign.as_str() == "-" { -amount } else { amount })
                    .and_then(|amount| unit_duration(unit.as_str(), amount))
                    .and_then(|offset| now.checked_add_signed(offset)),
                _ => Some(now),
            };
            shifted.map_or_else(|| captures[0].to_string(), format_timestamp)
        })
        .into_owned()
}

/// Timestamp format shared by `{now}` substitution and persisted tokeninfo dates.
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Parse the timestamp formats found in tokeninfo and validity options.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M%z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

/// Compare two operands, resolving `{now}` in the right-hand side first.
///
/// Integers compare numerically, timestamps chronologically, anything else lexically.
#[must_use]
pub fn compare_values(left: &str, comparator: Comparator, right: &str, now: DateTime<Utc>) -> bool {
    let right = substitute_now(right, now);
    let left = left.trim();
    let right = right.trim();

    if let (Ok(left), Ok(right)) = (left.parse::<i64>(), right.parse::<i64>()) {
        return comparator.holds(left.cmp(&right));
    }

    if let (Some(left), Some(right)) = (parse_timestamp(left), parse_timestamp(right)) {
        return comparator.holds(left.cmp(&right));
    }

    comparator.holds(left.cmp(right))
}
