//! Core telemetry types shared by the decoder, the store, and the HTTP layer.

use serde::{Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Zone key
// ---------------------------------------------------------------------------

/// Identity of one monitoring point: `(node_id, zone_id)`.
///
/// Rendered as `"node1/zone1"` in logs and JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneKey {
    node_id: String,
    zone_id: String,
}

impl ZoneKey {
    pub fn new(node_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            zone_id: zone_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.zone_id)
    }
}

impl Serialize for ZoneKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Device-reported timestamp, passed through untouched.
///
/// Firmware sends `millis()` since boot; the desktop simulator sends ISO-8601
/// text. Neither is trusted for staleness.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceTimestamp {
    Number(serde_json::Number),
    Text(String),
}

/// One INA219 sample for one zone, as accepted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub node_id: String,
    pub zone_id: String,
    #[serde(rename = "timestamp")]
    pub device_timestamp: DeviceTimestamp,
    #[serde(rename = "current_mA")]
    pub current_ma: f64,
    #[serde(rename = "voltage_V")]
    pub voltage_v: f64,
    #[serde(rename = "power_mW")]
    pub power_mw: f64,
}

impl Reading {
    pub fn key(&self) -> ZoneKey {
        ZoneKey::new(&self.node_id, &self.zone_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Reading {
        Reading {
            node_id: "node1".into(),
            zone_id: "zone1".into(),
            device_timestamp: DeviceTimestamp::Number(560625u64.into()),
            current_ma: 6.3,
            voltage_v: 3.308,
            power_mw: 20.0,
        }
    }

    #[test]
    fn zone_key_display() {
        assert_eq!(ZoneKey::new("node1", "zone2").to_string(), "node1/zone2");
    }

    #[test]
    fn zone_key_serializes_as_string() {
        let json = serde_json::to_value(ZoneKey::new("n", "z")).unwrap();
        assert_eq!(json, "n/z");
    }

    #[test]
    fn zone_keys_sort_by_node_then_zone() {
        let mut keys = vec![
            ZoneKey::new("node2", "zone1"),
            ZoneKey::new("node1", "zone3"),
            ZoneKey::new("node1", "zone1"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["node1/zone1", "node1/zone3", "node2/zone1"]);
    }

    #[test]
    fn reading_key_uses_payload_identity() {
        assert_eq!(sample().key(), ZoneKey::new("node1", "zone1"));
    }

    #[test]
    fn reading_serializes_with_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["timestamp"], 560625);
        assert_eq!(json["current_mA"], 6.3);
        assert_eq!(json["voltage_V"], 3.308);
        assert_eq!(json["power_mW"], 20.0);
        assert_eq!(json.as_object().unwrap().len(), 6);
    }

    #[test]
    fn text_timestamp_serializes_verbatim() {
        let r = Reading {
            device_timestamp: DeviceTimestamp::Text("2025-01-01T00:00:00Z".into()),
            ..sample()
        };
        let json = serde_json::to_value(r).unwrap();
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");
    }
}
