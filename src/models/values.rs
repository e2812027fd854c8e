//! Attribute value codecs shared by the XML reader, the writer and the
//! field maps used for change tracking.
//!
//! Every parser is strict and reports [`InvalidValue`]; callers decide which
//! default to fall back to. Formatting is the exact inverse so a value that
//! survives one read/write cycle is byte-stable afterwards.

use std::fmt;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// A value that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value {value:?}")]
pub struct InvalidValue {
    pub kind: &'static str,
    pub value: String,
}

impl InvalidValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Current local time truncated to the microsecond precision the file keeps.
pub fn now() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    let micros = now.nanosecond() / 1_000;
    now.with_nanosecond(micros * 1_000).unwrap_or(now)
}

/// Time given to date-only start values.
pub fn start_of_day() -> NaiveTime {
    NaiveTime::MIN
}

/// Time given to date-only end values (due, completion).
pub fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

/// Parse a timestamp written as `Y-M-D[ H:M[:S[.micro]]]`.
///
/// Empty text, `None`, and the sentinel years 1 and 9999 mean "no date".
/// Date-only values get `default_time`.
pub fn parse_datetime_or(
    text: &str,
    default_time: NaiveTime,
) -> Result<Option<NaiveDateTime>, InvalidValue> {
    let text = text.trim();
    if text.is_empty() || text == "None" {
        return Ok(None);
    }
    let invalid = || InvalidValue::new("datetime", text);

    let (text_main, micro) = match text.split_once('.') {
        Some((main, fraction)) => (main, Some(parse_fraction(fraction).ok_or_else(invalid)?)),
        None => (text, None),
    };

    let parts = text_main
        .split(['-', ':', ' '])
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    let (year, month, day) = match parts.as_slice() {
        [y, m, d, ..] => (*y, *m, *d),
        _ => return Err(invalid()),
    };
    if year <= 1 || year >= 9999 {
        return Ok(None);
    }
    let date = NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(invalid)?;

    let time = match (&parts[3..], micro) {
        ([], None) => Some(default_time),
        ([h, m], None) => NaiveTime::from_hms_opt(*h, *m, 0),
        ([h, m, s], None) => NaiveTime::from_hms_opt(*h, *m, *s),
        ([h, m, s], Some(micro)) => NaiveTime::from_hms_micro_opt(*h, *m, *s, micro),
        _ => None,
    }
    .ok_or_else(invalid)?;

    Ok(Some(date.and_time(time)))
}

/// Fractional seconds as microseconds. Digits past the sixth are dropped.
fn parse_fraction(digits: &str) -> Option<u32> {
    if digits.is_empty() || digits.len() > 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kept = &digits[..digits.len().min(6)];
    let value: u32 = kept.parse().ok()?;
    Some(value * 10u32.pow((6 - kept.len()) as u32))
}

/// Parse a timestamp, giving date-only values midnight.
pub fn parse_datetime(text: &str) -> Result<Option<NaiveDateTime>, InvalidValue> {
    parse_datetime_or(text, start_of_day())
}

/// Due dates saved at 23:59 by older releases mean "end of that day".
pub fn widen_end_of_day(dt: NaiveDateTime) -> NaiveDateTime {
    if dt.hour() == 23 && dt.minute() == 59 && dt.second() == 0 && dt.nanosecond() == 0 {
        dt.date().and_time(end_of_day())
    } else {
        dt
    }
}

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS[.ffffff]`.
pub fn format_datetime(dt: &NaiveDateTime) -> String {
    let micros = dt.nanosecond() / 1_000;
    if micros == 0 {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        format!("{}.{:06}", dt.format("%Y-%m-%d %H:%M:%S"), micros)
    }
}

/// Format an optional timestamp, `""` for none.
pub fn format_optional_datetime(dt: &Option<NaiveDateTime>) -> String {
    dt.as_ref().map(format_datetime).unwrap_or_default()
}

/// Effort timestamps are written with second precision.
pub fn format_effort_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a `True` / `False` attribute. Nothing else is accepted.
pub fn parse_bool(text: &str) -> Result<bool, InvalidValue> {
    match text {
        "True" => Ok(true),
        "False" => Ok(false),
        _ => Err(InvalidValue::new("boolean", text)),
    }
}

pub fn format_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

pub fn parse_int(text: &str) -> Result<i64, InvalidValue> {
    text.trim()
        .parse()
        .map_err(|_| InvalidValue::new("integer", text))
}

pub fn parse_float(text: &str) -> Result<f64, InvalidValue> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .ok_or_else(|| InvalidValue::new("number", text))
}

/// Floats keep a decimal point even when integral (`10.0`).
pub fn format_float(value: f64) -> String {
    format!("{:?}", value)
}

/// Parse a budget written as `H:MM:SS` (hours may exceed 24, may be negative).
pub fn parse_budget(text: &str) -> Result<Duration, InvalidValue> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Duration::zero());
    }
    let invalid = || InvalidValue::new("budget", text);
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let parts = body
        .split(':')
        .map(|p| p.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    let seconds = match parts.as_slice() {
        [h, m, s] if (0..60).contains(m) && (0..60).contains(s) => h * 3600 + m * 60 + s,
        [h, m] if (0..60).contains(m) => h * 3600 + m * 60,
        _ => return Err(invalid()),
    };
    Ok(Duration::seconds(if negative { -seconds } else { seconds }))
}

pub fn format_budget(budget: &Duration) -> String {
    let total = budget.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();
    format!(
        "{}{}:{:02}:{:02}",
        sign,
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// The alarm clock icon was renamed; old files still carry the short name.
pub fn normalize_icon(text: &str) -> String {
    if text == "clock_alarm" {
        "clock_alarm_icon".to_string()
    } else {
        text.to_string()
    }
}

/// Parse a parenthesised list of quoted strings: `('a', 'b')`, `('a',)`, `()`.
pub fn parse_string_tuple(text: &str) -> Result<Vec<String>, InvalidValue> {
    let invalid = || InvalidValue::new("tuple", text);
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(invalid)?;

    let mut items = Vec::new();
    for raw in inner.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let unquoted = raw
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .or_else(|| raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
            .ok_or_else(invalid)?;
        items.push(unquoted.to_string());
    }
    Ok(items)
}

/// Inverse of [`parse_string_tuple`]; items are sorted.
pub fn format_string_tuple(items: &[String]) -> String {
    let mut sorted: Vec<&String> = items.iter().collect();
    sorted.sort();
    match sorted.as_slice() {
        [] => "()".to_string(),
        [only] => format!("('{}',)", only),
        many => format!(
            "({})",
            many.iter()
                .map(|s| format!("'{}'", s))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// An RGBA colour stored as `(r, g, b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Parse `(r, g, b)` or `(r, g, b, a)`.
    pub fn parse(text: &str) -> Result<Self, InvalidValue> {
        let invalid = || InvalidValue::new("color", text);
        let inner = text
            .trim()
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let parts = inner
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        match parts.as_slice() {
            [r, g, b] => Ok(Self::rgb(*r, *g, *b)),
            [r, g, b, a] => Ok(Self {
                r: *r,
                g: *g,
                b: *b,
                a: *a,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.r, self.g, self.b, self.a)
    }
}

/// Parse a space separated id list, dropping empty entries.
pub fn parse_id_list(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_parse_datetime_full() {
        assert_eq!(
            parse_datetime("2010-04-12 13:45:10").unwrap(),
            Some(dt(2010, 4, 12, 13, 45, 10))
        );
    }

    #[test]
    fn test_parse_datetime_without_seconds() {
        assert_eq!(
            parse_datetime("2010-04-12 13:45").unwrap(),
            Some(dt(2010, 4, 12, 13, 45, 0))
        );
    }

    #[test]
    fn test_parse_date_only_uses_default_time() {
        let parsed = parse_datetime_or("2010-04-12", end_of_day())
            .unwrap()
            .unwrap();
        assert_eq!(parsed.time(), end_of_day());
        let parsed = parse_datetime("2010-04-12").unwrap().unwrap();
        assert_eq!(parsed.time(), NaiveTime::MIN);
    }

    #[test]
    fn test_parse_datetime_sentinels_are_none() {
        assert_eq!(parse_datetime("").unwrap(), None);
        assert_eq!(parse_datetime("None").unwrap(), None);
        assert_eq!(parse_datetime("1-1-1 0:0").unwrap(), None);
        assert_eq!(parse_datetime("9999-12-31 23:59:59.999999").unwrap(), None);
    }

    #[test]
    fn test_parse_datetime_garbage() {
        let err = parse_datetime("next tuesday").unwrap_err();
        assert_eq!(err.kind, "datetime");
        assert!(parse_datetime("2010-13-40").is_err());
    }

    #[test]
    fn test_datetime_microseconds_roundtrip() {
        let text = "2011-02-03 23:59:59.999999";
        let parsed = parse_datetime(text).unwrap().unwrap();
        assert_eq!(format_datetime(&parsed), text);
        assert_eq!(format_datetime(&dt(2011, 2, 3, 8, 0, 0)), "2011-02-03 08:00:00");
    }

    #[test]
    fn test_short_fraction_is_scaled_to_microseconds() {
        let parsed = parse_datetime("2024-01-02 10:00:00.5").unwrap().unwrap();
        assert_eq!(parsed.nanosecond(), 500_000_000);
        let parsed = parse_datetime("2024-01-02 10:00:00.000250").unwrap().unwrap();
        assert_eq!(parsed.nanosecond(), 250_000);
        let parsed = parse_datetime("2024-01-02 10:00:00.123456789").unwrap().unwrap();
        assert_eq!(parsed.nanosecond(), 123_456_000);
        assert!(parse_datetime("2024-01-02 10:00:00.").is_err());
        assert!(parse_datetime("2024-01-02 10:00:00.5x").is_err());
        assert!(parse_datetime("2024-01-02 10:00.5").is_err());
    }

    #[test]
    fn test_widen_end_of_day() {
        let widened = widen_end_of_day(dt(2012, 1, 1, 23, 59, 0));
        assert_eq!(widened.time(), end_of_day());
        let untouched = dt(2012, 1, 1, 23, 58, 0);
        assert_eq!(widen_end_of_day(untouched), untouched);
    }

    #[test]
    fn test_parse_bool_strict() {
        assert!(parse_bool("True").unwrap());
        assert!(!parse_bool("False").unwrap());
        assert!(parse_bool("true").is_err());
        assert!(parse_bool("").is_err());
    }

    #[test]
    fn test_budget() {
        assert_eq!(parse_budget("10:30:00").unwrap(), Duration::minutes(630));
        assert_eq!(parse_budget("").unwrap(), Duration::zero());
        assert_eq!(parse_budget("-1:00:00").unwrap(), Duration::hours(-1));
        assert!(parse_budget("1:75:00").is_err());
        assert_eq!(format_budget(&Duration::seconds(3 * 3600 + 62)), "3:01:02");
        assert_eq!(format_budget(&Duration::hours(-2)), "-2:00:00");
    }

    #[test]
    fn test_float_format_keeps_decimal_point() {
        assert_eq!(format_float(10.0), "10.0");
        assert_eq!(format_float(12.5), "12.5");
        assert!(parse_float("abc").is_err());
    }

    #[test]
    fn test_string_tuple() {
        assert_eq!(
            parse_string_tuple("('taskviewer', \"noteviewer\")").unwrap(),
            vec!["taskviewer".to_string(), "noteviewer".to_string()]
        );
        assert_eq!(
            parse_string_tuple("('one',)").unwrap(),
            vec!["one".to_string()]
        );
        assert!(parse_string_tuple("()").unwrap().is_empty());
        assert!(parse_string_tuple("taskviewer").is_err());

        assert_eq!(format_string_tuple(&["b".into(), "a".into()]), "('a', 'b')");
        assert_eq!(format_string_tuple(&["a".into()]), "('a',)");
    }

    #[test]
    fn test_color() {
        assert_eq!(Color::parse("(255, 0, 0)").unwrap(), Color::rgb(255, 0, 0));
        let c = Color::parse("(1, 2, 3, 4)").unwrap();
        assert_eq!(c.to_string(), "(1, 2, 3, 4)");
        assert!(Color::parse("(300, 0, 0)").is_err());
        assert!(Color::parse("red").is_err());
    }

    #[test]
    fn test_icon_rename() {
        assert_eq!(normalize_icon("clock_alarm"), "clock_alarm_icon");
        assert_eq!(normalize_icon("star"), "star");
    }

    #[test]
    fn test_id_list() {
        assert_eq!(parse_id_list(" a  b "), vec!["a".to_string(), "b".to_string()]);
        assert!(parse_id_list("").is_empty());
    }
}
