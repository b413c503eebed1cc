use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use crate::readings::{MeasurementValue, Measurements, NormalizedReading, MAX_IDENTIFIER_LEN};

/// Reading as submitted by a gateway. Every field is optional on the wire so that missing
/// values surface as validation errors instead of body rejections.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct RawReading {
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    /// ISO-8601 / RFC 3339; values without an offset are taken as UTC. Defaults to now.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub moisture: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    /// Open map of extra numeric or string measurements.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub measurements: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed request body: {0}")]
    Malformed(String),
    #[error("payload is {size} bytes; the limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("timestamp {0:?} is not an ISO-8601 date-time")]
    InvalidTimestamp(String),
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{0} must not contain NUL characters")]
    NulCharacter(String),
    #[error("measurement keys must be non-empty")]
    EmptyMeasurementKey,
    #[error("measurement {0:?} must be a number or a string")]
    InvalidMeasurement(String),
    #[error("Idempotency-Key must be at most {0} characters")]
    IdempotencyKeyTooLong(usize),
}

pub fn parse_raw_reading(body: &[u8]) -> Result<RawReading, ValidationError> {
    serde_json::from_slice(body).map_err(|err| ValidationError::Malformed(err.to_string()))
}

/// Validates `raw` and fills defaults. Pure apart from the `now` it is handed.
pub fn normalize(
    raw: RawReading,
    submitted_by: Option<i64>,
    now: DateTime<Utc>,
) -> Result<NormalizedReading, ValidationError> {
    let gateway_id = required_identifier("gateway_id", raw.gateway_id)?;
    let node_id = required_identifier("node_id", raw.node_id)?;
    let timestamp = match raw.timestamp {
        Some(value) => parse_timestamp(&value)?,
        None => now,
    };

    Ok(NormalizedReading {
        gateway_id,
        node_id,
        timestamp,
        humidity: bounded("humidity", raw.humidity, Some((0.0, 100.0)))?,
        moisture: bounded("moisture", raw.moisture, Some((0.0, 100.0)))?,
        temperature: bounded("temperature", raw.temperature, None)?,
        battery_voltage: bounded("battery_voltage", raw.battery_voltage, Some((0.0, 5.0)))?,
        measurements: raw.measurements.map(measurements).transpose()?,
        submitted_by,
    })
}

fn required_identifier(
    field: &'static str,
    value: Option<String>,
) -> Result<String, ValidationError> {
    let value = value.as_deref().map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    if value.contains('\0') {
        return Err(ValidationError::NulCharacter(field.to_string()));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_IDENTIFIER_LEN,
        });
    }
    Ok(value.to_string())
}

fn bounded(
    field: &'static str,
    value: Option<f64>,
    range: Option<(f64, f64)>,
) -> Result<Option<f64>, ValidationError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if !value.is_finite() {
        return Err(ValidationError::NotFinite(field));
    }
    if let Some((min, max)) = range {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field,
                min,
                max,
                value,
            });
        }
    }
    Ok(Some(value))
}

fn measurements(raw: Map<String, JsonValue>) -> Result<Measurements, ValidationError> {
    let mut out = Measurements::new();
    for (key, value) in raw {
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyMeasurementKey);
        }
        if key.contains('\0') {
            return Err(ValidationError::NulCharacter("measurement keys".to_string()));
        }
        let value = MeasurementValue::from_json(&value)
            .ok_or_else(|| ValidationError::InvalidMeasurement(key.clone()))?;
        if matches!(&value, MeasurementValue::Text(text) if text.contains('\0')) {
            return Err(ValidationError::NulCharacter(format!("measurement {key:?}")));
        }
        out.insert(key, value);
    }
    Ok(out)
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(ValidationError::InvalidTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawReading {
        serde_json::from_value(value).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fills_missing_timestamp_and_trims_identifiers() {
        let reading = normalize(
            raw(json!({"gateway_id": "  GW-7 ", "node_id": "N1", "humidity": 40})),
            Some(3),
            now(),
        )
        .unwrap();
        assert_eq!(reading.gateway_id, "GW-7");
        assert_eq!(reading.timestamp, now());
        assert_eq!(reading.humidity, Some(40.0));
        assert_eq!(reading.submitted_by, Some(3));
        assert!(reading.measurements.is_none());
    }

    #[test]
    fn missing_or_blank_identifiers_are_rejected() {
        let err = normalize(raw(json!({"node_id": "N1"})), None, now()).unwrap_err();
        assert_eq!(err, ValidationError::Missing("gateway_id"));

        let err = normalize(raw(json!({"gateway_id": "G", "node_id": "  "})), None, now())
            .unwrap_err();
        assert_eq!(err, ValidationError::Missing("node_id"));

        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        let err = normalize(raw(json!({"gateway_id": long, "node_id": "N"})), None, now())
            .unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { field: "gateway_id", .. }));
    }

    #[test]
    fn timestamps_are_canonicalised_to_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        for value in [
            "2024-05-01T10:30:00Z",
            "2024-05-01T12:30:00+02:00",
            "2024-05-01T10:30:00",
            "2024-05-01 10:30:00",
            "2024-05-01 12:30:00+02:00",
            "2024-05-01T12:30:00+0200",
            "2024-05-01T08:30:00.000-0200",
            "2024-05-01 12:30:00+0200",
            "2024-05-01T10:30",
        ] {
            assert_eq!(parse_timestamp(value).unwrap(), expected, "{value}");
        }
        assert_eq!(
            parse_timestamp("2024-05-01T10:30:00.250Z").unwrap(),
            expected + chrono::Duration::milliseconds(250)
        );
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(ValidationError::InvalidTimestamp(_))
        ));
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn scalar_ranges_are_enforced() {
        let base = json!({"gateway_id": "G", "node_id": "N"});
        for (field, value) in [
            ("humidity", 100.5),
            ("moisture", -1.0),
            ("battery_voltage", 5.1),
        ] {
            let mut body = base.clone();
            body[field] = json!(value);
            let err = normalize(raw(body), None, now()).unwrap_err();
            assert!(matches!(err, ValidationError::OutOfRange { .. }), "{field}");
        }

        let mut body = base.clone();
        body["temperature"] = json!(-40.0);
        assert!(normalize(raw(body), None, now()).is_ok());
    }

    #[test]
    fn measurements_accept_numbers_and_strings_only() {
        let reading = normalize(
            raw(json!({
                "gateway_id": "G",
                "node_id": "N",
                "measurements": {"npk_n": 12, "soil": "clay"}
            })),
            None,
            now(),
        )
        .unwrap();
        let measurements = reading.measurements.unwrap();
        assert_eq!(measurements.get("npk_n"), Some(&MeasurementValue::Number(12.0)));
        assert_eq!(
            measurements.get("soil"),
            Some(&MeasurementValue::Text("clay".to_string()))
        );

        let err = normalize(
            raw(json!({"gateway_id": "G", "node_id": "N", "measurements": {"ok": true}})),
            None,
            now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidMeasurement("ok".to_string()));

        let err = normalize(
            raw(json!({"gateway_id": "G", "node_id": "N", "measurements": {" ": 1}})),
            None,
            now(),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::EmptyMeasurementKey);
    }

    #[test]
    fn malformed_bodies_become_validation_errors() {
        assert!(matches!(
            parse_raw_reading(b"{\"gateway_id\": 5"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            parse_raw_reading(b"{\"humidity\": \"wet\"}"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn nul_characters_are_rejected_up_front() {
        for body in [
            json!({"gateway_id": "G", "node_id": "a\u{0000}b"}),
            json!({"gateway_id": "G\u{0000}", "node_id": "N"}),
            json!({"gateway_id": "G", "node_id": "N", "measurements": {"k\u{0000}": 1}}),
            json!({"gateway_id": "G", "node_id": "N", "measurements": {"soil": "cl\u{0000}ay"}}),
        ] {
            let err = normalize(raw(body.clone()), None, now()).unwrap_err();
            assert!(matches!(err, ValidationError::NulCharacter(_)), "{body}");
        }
    }
}
