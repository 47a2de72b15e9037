//! Sensor readings and the line format of the inbound stream.
//!
//! Each useful line looks like
//! `data: {"time": "11/23/2023 16:02:31.580123", "values": {"Current": 12.5}}`.
//! Some producers emit single-quoted pseudo-JSON, which is accepted as well.

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Prefix of every data line on the stream.
pub const DATA_PREFIX: &str = "data: ";

/// Timestamp format used by the data service.
pub const TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S%.f";

/// One numeric sample of the monitored metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub value: f64,
    /// Sample time, UTC milliseconds since the epoch
    pub timestamp_ms: i64,
}

impl SensorReading {
    pub fn new(value: f64, timestamp_ms: i64) -> Self {
        Self {
            value,
            timestamp_ms,
        }
    }
}

/// Raw payload of a data line.
#[derive(Debug, Deserialize)]
struct StreamPayload {
    time: Option<String>,
    #[serde(default)]
    values: HashMap<String, serde_json::Value>,
}

/// Errors raised while consuming the stream.
#[derive(Debug)]
pub enum StreamError {
    /// Connection failed or dropped
    Transport(String),
    /// The data service answered with a non-success status
    Status(u16),
    /// A line could not be understood
    MalformedInput(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transport(msg) => write!(f, "Stream transport error: {msg}"),
            StreamError::Status(code) => write!(f, "Stream returned status {code}"),
            StreamError::MalformedInput(msg) => write!(f, "Malformed stream line: {msg}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Parse the `time` field of a payload into UTC milliseconds.
pub fn parse_timestamp(time: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(time.trim(), TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive).timestamp_millis())
}

/// Parse one line of the stream.
///
/// Returns `Err(MalformedInput)` for lines without the `data: ` prefix or with
/// unparseable JSON. Returns `Ok(None)` for well-formed payloads that carry no
/// usable reading (missing value or timestamp); those are dropped silently.
pub fn parse_line(line: &str, value_key: &str) -> Result<Option<SensorReading>, StreamError> {
    let Some(body) = line.strip_prefix(DATA_PREFIX) else {
        return Err(StreamError::MalformedInput(format!(
            "unexpected line format: {line}"
        )));
    };

    let json = body.replace('\'', "\"");
    let payload: StreamPayload = serde_json::from_str(&json)
        .map_err(|e| StreamError::MalformedInput(format!("{e}: {body}")))?;

    let Some(value) = payload.values.get(value_key).and_then(|v| v.as_f64()) else {
        return Ok(None);
    };
    if !value.is_finite() {
        return Ok(None);
    }
    let Some(timestamp_ms) = payload.time.as_deref().and_then(parse_timestamp) else {
        return Ok(None);
    };

    Ok(Some(SensorReading::new(value, timestamp_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let line = r#"data: {"time": "11/23/2023 16:02:31.580000", "values": {"Current": 12.5, "Voltage": 120}}"#;
        let reading = parse_line(line, "Current").unwrap().unwrap();
        assert_eq!(reading.value, 12.5);
        assert_eq!(reading.timestamp_ms, 1_700_755_351_580);
    }

    #[test]
    fn test_parse_single_quoted_line() {
        let line = "data: {'time': '01/02/2024 00:00:00.000001', 'values': {'Current': 3}}";
        let reading = parse_line(line, "Current").unwrap().unwrap();
        assert_eq!(reading.value, 3.0);
    }

    #[test]
    fn test_missing_value_is_dropped_silently() {
        let line = r#"data: {"time": "11/23/2023 16:02:31.580000", "values": {"Voltage": 120}}"#;
        assert!(parse_line(line, "Current").unwrap().is_none());
    }

    #[test]
    fn test_bad_timestamp_is_dropped_silently() {
        let line = r#"data: {"time": "2023-11-23T16:02:31Z", "values": {"Current": 1.0}}"#;
        assert!(parse_line(line, "Current").unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line("event: ping", "Current"),
            Err(StreamError::MalformedInput(_))
        ));
        assert!(matches!(
            parse_line("data: {not json", "Current"),
            Err(StreamError::MalformedInput(_))
        ));
    }
}
