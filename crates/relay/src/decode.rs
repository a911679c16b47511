//! MQTT payload decoding and topic helpers.
//!
//! Attribution always comes from the payload's `node_id`/`zone_id`; the
//! topic is only parsed to flag publishers whose topic and payload disagree.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::reading::{DeviceTimestamp, Reading};

/// Every field a telemetry payload must carry, in wire order.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "node_id",
    "zone_id",
    "timestamp",
    "current_mA",
    "voltage_V",
    "power_mW",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("field `{field}` {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl DecodeError {
    /// Names of the offending fields, empty when the payload as a whole
    /// could not be read.
    pub fn fields(&self) -> &[&'static str] {
        match self {
            Self::MissingFields(fields) => fields,
            Self::InvalidField { field, .. } => std::slice::from_ref(field),
            Self::Json(_) | Self::NotAnObject => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// Decode one telemetry payload received on `topic` into a [`Reading`].
///
/// `null` counts as missing. Measurements accept JSON numbers or numeric
/// strings; the device timestamp accepts a number or a string and is kept
/// as sent. A topic that names a different zone is logged, never trusted.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Reading, DecodeError> {
    let reading = decode_payload(payload)?;

    if let Some((node_id, zone_id)) = topic_zone(topic) {
        if node_id != reading.node_id || zone_id != reading.zone_id {
            debug!(
                topic,
                node_id = %reading.node_id,
                zone_id = %reading.zone_id,
                "topic and payload attribution differ; using payload"
            );
        }
    }
    Ok(reading)
}

fn decode_payload(payload: &[u8]) -> Result<Reading, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .into_iter()
        .filter(|field| map.get(*field).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(DecodeError::MissingFields(missing));
    }

    Ok(Reading {
        node_id: identifier(&map, "node_id")?,
        zone_id: identifier(&map, "zone_id")?,
        device_timestamp: device_timestamp(&map, "timestamp")?,
        current_ma: measurement(&map, "current_mA")?,
        voltage_v: measurement(&map, "voltage_V")?,
        power_mw: measurement(&map, "power_mW")?,
    })
}

fn identifier(map: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match &map[field] {
        Value::String(s) if s.trim().is_empty() => Err(DecodeError::InvalidField {
            field,
            reason: "is empty",
        }),
        Value::String(s) if s.contains('/') => Err(DecodeError::InvalidField {
            field,
            reason: "must not contain '/'",
        }),
        Value::String(s) => Ok(s.clone()),
        _ => Err(DecodeError::InvalidField {
            field,
            reason: "is not a string",
        }),
    }
}

fn device_timestamp(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<DeviceTimestamp, DecodeError> {
    match &map[field] {
        Value::Number(n) => Ok(DeviceTimestamp::Number(n.clone())),
        Value::String(s) if !s.trim().is_empty() => Ok(DeviceTimestamp::Text(s.clone())),
        _ => Err(DecodeError::InvalidField {
            field,
            reason: "is not a number or timestamp string",
        }),
    }
}

fn measurement(map: &Map<String, Value>, field: &'static str) -> Result<f64, DecodeError> {
    let parsed = match &map[field] {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(DecodeError::InvalidField {
            field,
            reason: "is not a finite number",
        }),
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract `(node_id, zone_id)` from "/<node_id>/<zone_id>".
pub fn topic_zone(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0].is_empty() && !parts[1].is_empty() && !parts[2].is_empty()
    {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
