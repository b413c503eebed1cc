//! `measurements` column encoding: a flat JSON object of numbers and strings.

use serde_json::{Map, Value as JsonValue};

use super::StoreError;
use crate::readings::{MeasurementValue, Measurements};

pub fn encode_measurements(measurements: &Measurements) -> Result<JsonValue, StoreError> {
    let mut object = Map::with_capacity(measurements.len());
    for (key, value) in measurements {
        let encoded = value.to_json().ok_or_else(|| {
            StoreError::Rejected(format!("measurement {key:?} is not a finite number"))
        })?;
        object.insert(key.clone(), encoded);
    }
    Ok(JsonValue::Object(object))
}

/// Entries that are neither numbers nor strings are dropped; only rows edited outside
/// this service can contain them.
pub fn decode_measurements(value: JsonValue) -> Option<Measurements> {
    let JsonValue::Object(object) = value else {
        tracing::warn!("ignoring non-object measurements column");
        return None;
    };
    let mut measurements = Measurements::new();
    for (key, entry) in object {
        match MeasurementValue::from_json(&entry) {
            Some(decoded) => {
                measurements.insert(key, decoded);
            }
            None => tracing::warn!(key = %key, "ignoring unsupported stored measurement"),
        }
    }
    Some(measurements)
}
