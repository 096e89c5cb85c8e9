//! Device telemetry payloads
//!
//! Devices publish [`DeviceReading`] JSON with their credential embedded.
//! The ingress stage strips the credential and forwards a
//! [`TelemetryRecord`]; the loader decodes records back out of the log.

use bytes::Bytes;
use kanava_core::PluginError;
use serde::{Deserialize, Serialize};

/// Reading as published by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub battery: f64,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Authenticated reading, credential removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub battery: f64,
    pub timestamp: i64,
}

impl DeviceReading {
    /// Parse a reading from a message payload
    pub fn decode(payload: &[u8]) -> Result<Self, PluginError> {
        serde_json::from_slice(payload)
            .map_err(|e| PluginError::Decode(format!("invalid device reading: {e}")))
    }

    /// Serialize for publishing
    pub fn encode(&self) -> Result<Bytes, PluginError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| PluginError::Decode(format!("encode device reading: {e}")))
    }

    /// Split into the credential and the forwardable record
    pub fn into_parts(self) -> (Option<String>, TelemetryRecord) {
        let record = TelemetryRecord {
            id: self.id,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            battery: self.battery,
            timestamp: self.timestamp,
        };
        (self.token, record)
    }
}

impl TelemetryRecord {
    /// Parse a record from a log payload
    pub fn decode(payload: &[u8]) -> Result<Self, PluginError> {
        serde_json::from_slice(payload)
            .map_err(|e| PluginError::Decode(format!("invalid telemetry record: {e}")))
    }

    /// Serialize for forwarding
    pub fn encode(&self) -> Result<Bytes, PluginError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| PluginError::Decode(format!("encode telemetry record: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const READING: &str = r#"{"id":"dev-1","latitude":55.7,"longitude":37.6,
        "altitude":120.0,"battery":88.0,"timestamp":1700000000,"token":"abc"}"#;

    #[test]
    fn test_reading_splits_token_from_record() {
        let reading = DeviceReading::decode(READING.as_bytes()).unwrap();
        let (token, record) = reading.into_parts();

        assert_eq!(token.as_deref(), Some("abc"));
        assert_eq!(record.id, "dev-1");
        assert_eq!(record.timestamp, 1_700_000_000);

        let encoded = record.encode().unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(!text.contains("token"));
        assert_eq!(TelemetryRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_reading_without_token_decodes() {
        let json = r#"{"id":"d","latitude":0,"longitude":0,"altitude":0,"battery":1,"timestamp":0}"#;
        let reading = DeviceReading::decode(json.as_bytes()).unwrap();
        assert!(reading.token.is_none());
    }

    #[test]
    fn test_malformed_reading_is_decode_error() {
        for bad in [&b"not json"[..], b"{}", br#"{"id":1}"#] {
            let err = DeviceReading::decode(bad).unwrap_err();
            assert!(matches!(err, PluginError::Decode(_)));
        }
    }
}
