//! Reading types shared by the gateway, the queue backends and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Column width of `gateway_id` / `node_id` in `sensor_readings`.
pub const MAX_IDENTIFIER_LEN: usize = 50;

/// A single entry of the open `measurements` map.
///
/// Only numbers and strings are representable; anything else is rejected at the
/// ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f64),
    Text(String),
}

impl MeasurementValue {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(number) => number
                .as_f64()
                .filter(|v| v.is_finite())
                .map(MeasurementValue::Number),
            JsonValue::String(text) => Some(MeasurementValue::Text(text.clone())),
            _ => None,
        }
    }

    /// `None` for non-finite numbers, which JSON cannot carry.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            MeasurementValue::Number(value) => {
                serde_json::Number::from_f64(*value).map(JsonValue::Number)
            }
            MeasurementValue::Text(text) => Some(JsonValue::String(text.clone())),
        }
    }
}

pub type Measurements = BTreeMap<String, MeasurementValue>;

/// A validated reading as it travels through the queue. It has no ID yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReading {
    pub gateway_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub moisture: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub measurements: Option<Measurements>,
    /// Owner of the API key that submitted the reading.
    #[serde(default)]
    pub submitted_by: Option<i64>,
}

/// A persisted reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: i64,
    pub gateway_id: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub humidity: Option<f64>,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub measurements: Option<Measurements>,
    pub created_at: DateTime<Utc>,
}

/// The durable, in-flight wrapper around a reading awaiting persistence.
///
/// `attempts` counts deliveries, including the one in progress; the queue bumps it when it
/// leases the job, so a worker that dies mid-write still spends an attempt.
/// `next_attempt_at` is the earliest time the queue may hand the job out again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub reading: NormalizedReading,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn new(job_id: Uuid, reading: NormalizedReading, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            reading,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_error: None,
        }
    }
}

/// A job that will not be retried again and needs operator attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub reading: NormalizedReading,
    pub reason: String,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_job(job: &QueuedJob, attempts: u32, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id,
            reading: job.reading.clone(),
            reason: reason.to_string(),
            attempts,
            first_seen_at: job.enqueued_at,
            dead_lettered_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn measurement_values_accept_numbers_and_strings_only() {
        assert_eq!(
            MeasurementValue::from_json(&json!(12.5)),
            Some(MeasurementValue::Number(12.5))
        );
        assert_eq!(
            MeasurementValue::from_json(&json!("loam")),
            Some(MeasurementValue::Text("loam".to_string()))
        );
        assert_eq!(MeasurementValue::from_json(&json!(true)), None);
        assert_eq!(MeasurementValue::from_json(&json!(null)), None);
        assert_eq!(MeasurementValue::from_json(&json!({"n": 1})), None);
    }

    #[test]
    fn queued_job_payload_keeps_measurement_types() {
        let mut measurements = Measurements::new();
        measurements.insert("npk_n".to_string(), MeasurementValue::Number(12.5));
        measurements.insert("soil".to_string(), MeasurementValue::Text("clay".to_string()));
        let now = Utc::now();
        let job = QueuedJob::new(
            Uuid::new_v4(),
            NormalizedReading {
                gateway_id: "GW-1".to_string(),
                node_id: "NODE-1".to_string(),
                timestamp: now,
                humidity: Some(40.0),
                moisture: None,
                temperature: None,
                battery_voltage: None,
                measurements: Some(measurements),
                submitted_by: Some(7),
            },
            now,
        );

        let encoded = serde_json::to_vec(&job).unwrap();
        let decoded: QueuedJob = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}
