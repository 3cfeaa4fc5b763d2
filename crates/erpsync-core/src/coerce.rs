//! Total coercions from loosely-typed upstream fields into column values.
//!
//! Missing fields and JSON nulls always fall back to the documented default.
//! Only [`as_timestamp`] can fail, and only for a present but malformed value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use serde_json::Value;
use thiserror::Error;

use crate::RawRecord;

const TIMESTAMP_OUTPUT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("field `{field}` holds an invalid timestamp: {value}")]
    InvalidTimestamp { field: String, value: String },
}

pub fn as_text(row: &RawRecord, field: &str, default: Option<&str>) -> Option<String> {
    match row.get(field) {
        None | Some(Value::Null) => default.map(ToString::to_string),
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Bool(b)) => Some(if *b { "1" } else { "0" }.to_string()),
        Some(other) => Some(other.to_string()),
    }
}

pub fn as_int(row: &RawRecord, field: &str, default: i64) -> i64 {
    match row.get(field) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => parse_int_text(s).unwrap_or(default),
        Some(Value::Bool(b)) => i64::from(*b),
        _ => default,
    }
}

pub fn as_float(row: &RawRecord, field: &str, default: f64) -> f64 {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(default),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => default,
    }
}

pub fn as_bool_flag(row: &RawRecord, field: &str) -> bool {
    match row.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Calendar date from the first ten characters of an ISO-ish date-time.
pub fn as_date(row: &RawRecord, field: &str) -> Option<NaiveDate> {
    let Some(Value::String(s)) = row.get(field) else {
        return None;
    };
    let prefix: String = s.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&prefix, "%Y-%m-%d").ok()
}

pub fn as_timestamp(row: &RawRecord, field: &str) -> Result<Option<NaiveDateTime>, CoercionError> {
    let text = match row.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim(),
        Some(other) => {
            return Err(CoercionError::InvalidTimestamp {
                field: field.to_string(),
                value: other.to_string(),
            })
        }
    };
    parse_timestamp(text)
        .map(Some)
        .ok_or_else(|| CoercionError::InvalidTimestamp {
            field: field.to_string(),
            value: text.to_string(),
        })
}

/// Parses a date-time, keeping the wall-clock time written in the source and
/// dropping sub-second precision.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| {
            NAIVE_TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    parsed.with_nanosecond(0)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_OUTPUT).to_string()
}

fn parse_int_text(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
    })
}
