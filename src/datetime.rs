// Date and time handling
// Timestamp parsing accepts the formats the language has always accepted;
// formatTime() uses chrono strftime patterns as the reference format shape.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;

/// Date/time errors
#[derive(Error, Debug)]
pub enum DateTimeError {
    #[error("cannot parse timestamp: {0}")]
    Timestamp(String),

    #[error("cannot parse duration: {0}")]
    Duration(String),

    #[error("invalid time format pattern: {0}")]
    Format(String),
}

/// Parse a timestamp string.
///
/// Accepted shapes, tried in order: RFC 3339 (with or without fractional
/// seconds), `YYYY-MM-DD HH:MM:SS` (taken as UTC), and bare `YYYY-MM-DD`
/// (midnight UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DateTimeError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    }
    Err(DateTimeError::Timestamp(s.to_string()))
}

/// Format a timestamp with a chrono strftime pattern (e.g. `%Y-%m-%d %H:%M`).
///
/// The pattern is validated up front so a bad specifier reports an error
/// instead of failing mid-format.
pub fn format_timestamp(t: &DateTime<Utc>, pattern: &str) -> Result<String, DateTimeError> {
    let items: Vec<Item> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(DateTimeError::Format(pattern.to_string()));
    }
    Ok(t.format_with_items(items.into_iter()).to_string())
}

/// Parse a duration literal: a signed sequence of decimal numbers with unit
/// suffixes, e.g. `1h30m`, `300ms`, `2.5s`, `-90m`. Units: ns, us/µs, ms, s,
/// m, h.
pub fn parse_duration(s: &str) -> Result<chrono::Duration, DateTimeError> {
    let original = s;
    let mut rest = s.trim();

    let mut negative = false;
    if let Some(r) = rest.strip_prefix('-') {
        negative = true;
        rest = r;
    } else if let Some(r) = rest.strip_prefix('+') {
        rest = r;
    }

    if rest == "0" {
        return Ok(chrono::Duration::zero());
    }
    if rest.is_empty() {
        return Err(DateTimeError::Duration(original.to_string()));
    }

    let mut total_ns: i128 = 0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return Err(DateTimeError::Duration(original.to_string()));
        }
        let (num, after_num) = rest.split_at(num_end);
        let magnitude: f64 = num
            .parse()
            .map_err(|_| DateTimeError::Duration(original.to_string()))?;

        let unit_end = after_num
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_num.len());
        let (unit, after_unit) = after_num.split_at(unit_end);
        let scale: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return Err(DateTimeError::Duration(original.to_string())),
        };

        total_ns += (magnitude * scale) as i128;
        rest = after_unit;
    }

    if negative {
        total_ns = -total_ns;
    }
    let ns = i64::try_from(total_ns)
        .map_err(|_| DateTimeError::Duration(original.to_string()))?;
    Ok(chrono::Duration::nanoseconds(ns))
}

/// Render a duration back into literal form: `0s`, `123ns`, `1.5ms`,
/// `2m5s`, `1h30m0s`. Inverse-compatible with [`parse_duration`].
pub fn format_duration(d: chrono::Duration) -> String {
    let mut ns = match d.num_nanoseconds() {
        Some(n) => n,
        // Out of nanosecond range; fall back to whole seconds
        None => return format!("{}s", d.num_seconds()),
    };

    if ns == 0 {
        return "0s".to_string();
    }
    let negative = ns < 0;
    if negative {
        ns = -ns;
    }

    let body = if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        with_fraction(ns, 1_000, "µs")
    } else if ns < 1_000_000_000 {
        with_fraction(ns, 1_000_000, "ms")
    } else {
        let secs = ns / 1_000_000_000;
        let frac_ns = ns % 1_000_000_000;
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;

        let mut out = String::new();
        if hours > 0 {
            out.push_str(&format!("{}h", hours));
        }
        if hours > 0 || minutes > 0 {
            out.push_str(&format!("{}m", minutes));
        }
        if frac_ns == 0 {
            out.push_str(&format!("{}s", seconds));
        } else {
            let frac = format!("{:09}", frac_ns);
            out.push_str(&format!("{}.{}s", seconds, frac.trim_end_matches('0')));
        }
        out
    };

    if negative {
        format!("-{}", body)
    } else {
        body
    }
}

fn with_fraction(ns: i64, unit: i64, suffix: &str) -> String {
    let whole = ns / unit;
    let frac = ns % unit;
    if frac == 0 {
        format!("{}{}", whole, suffix)
    } else {
        let width = if unit == 1_000 { 3 } else { 6 };
        let frac_str = format!("{:0width$}", frac, width = width);
        format!("{}.{}{}", whole, frac_str.trim_end_matches('0'), suffix)
    }
}
