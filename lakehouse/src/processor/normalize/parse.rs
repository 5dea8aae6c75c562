//! Value-level parsing shared by the normalizer and the station builder.

use chrono::{Datelike, NaiveDateTime, Timelike};

const TIMESTAMP_FORMATS: [&str; 8] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Station ids arrive as `31000`, `"31000"` or `"31000.0"`; all map to `31000`.
pub fn normalize_station_id(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if let Ok(id) = digits.parse::<i64>() {
        return Some(id);
    }

    // Exponent or multi-zero float renderings such as "31000.00" or "3.1e4".
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64)
        .map(|v| v as i64)
}

/// Parses a naive local timestamp; unparsable input yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
}

pub fn parse_timestamp_millis(raw: &str) -> Option<i64> {
    parse_timestamp(raw).map(|ts| ts.and_utc().timestamp_millis())
}

pub fn millis_to_datetime(millis: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

/// `(day, hour, weekday)` with ISO weekday numbering (Monday = 1).
pub fn calendar_fields(millis: i64) -> Option<(i8, i8, i8)> {
    let ts = millis_to_datetime(millis)?;
    Some((
        ts.day() as i8,
        ts.hour() as i8,
        ts.weekday().number_from_monday() as i8,
    ))
}

pub fn normalize_member_type(raw: &str) -> String {
    match raw.trim() {
        "Registered" | "Subscriber" => "Member".to_string(),
        other => other.to_string(),
    }
}

pub fn normalize_rideable_type(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "classic_bike" => Some("classic_bike"),
        "electric_bike" => Some("electric_bike"),
        "docked_bike" => Some("docked_bike"),
        _ => None,
    }
}
