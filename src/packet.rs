//! Shared decoded-packet representation.
//!
//! The bridge's three wire encodings (already-structured, JSON bytes,
//! base64/protobuf) all converge on the same shape: a JSON object with the
//! Meshtastic field names preserved (`fromId`, `toId`, `id`, `rxTime`,
//! `decoded.portnum`, `decoded.payload`, ...). [`DecodedPacket`] is that
//! object, and every consumer (NodeCache, TracerouteManager, the correlator)
//! reads out of it rather than owning a typed packet struct, mirroring how
//! loosely the original treats packets as dicts.

use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedPacket(pub Map<String, Value>);

impl DecodedPacket {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn from_id(&self) -> Option<&str> {
        self.0.get("fromId").and_then(Value::as_str)
    }

    pub fn to_id(&self) -> Option<&str> {
        self.0.get("toId").and_then(Value::as_str)
    }

    pub fn packet_id(&self) -> Option<u32> {
        self.0
            .get("id")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    }

    pub fn rx_time(&self) -> Option<i64> {
        self.0.get("rxTime").and_then(Value::as_i64)
    }

    fn decoded(&self) -> Option<&Map<String, Value>> {
        self.0.get("decoded").and_then(Value::as_object)
    }

    pub fn portnum(&self) -> Option<&str> {
        self.decoded()?.get("portnum").and_then(Value::as_str)
    }

    /// The decoded payload as raw bytes, tolerating either a raw byte array
    /// or a base64-encoded string (matching the original's permissiveness).
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        let payload = self.decoded()?.get("payload")?;
        match payload {
            Value::String(s) => base64_decode(s).or_else(|| Some(s.clone().into_bytes())),
            Value::Array(arr) => arr
                .iter()
                .map(|v| v.as_u64().map(|n| n as u8))
                .collect::<Option<Vec<u8>>>(),
            _ => None,
        }
    }

    pub fn payload_text(&self) -> Option<String> {
        let bytes = self.payload_bytes()?;
        String::from_utf8(bytes).ok()
    }

    /// Position fields converted from Meshtastic fixed-point ints to degrees.
    pub fn position(&self) -> Option<PacketPosition> {
        let decoded = self.decoded()?;
        let position_obj = decoded.get("position").and_then(Value::as_object)?;
        let latitude_i = position_obj.get("latitude_i")?.as_i64()?;
        let longitude_i = position_obj.get("longitude_i")?.as_i64()?;
        let altitude = position_obj.get("altitude").and_then(Value::as_f64);
        Some(PacketPosition {
            latitude: latitude_i as f64 / 1e7,
            longitude: longitude_i as f64 / 1e7,
            altitude_meters: altitude,
        })
    }

    pub fn user_long_name(&self) -> Option<String> {
        let decoded = self.decoded()?;
        let user = decoded.get("user").and_then(Value::as_object)?;
        user.get("longName")
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacketPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: Option<f64>,
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packet(value: Value) -> DecodedPacket {
        DecodedPacket::from_map(value.as_object().unwrap().clone())
    }

    #[test]
    fn extracts_position_with_fixed_point_conversion() {
        let p = packet(json!({
            "fromId": "!abcd1234",
            "decoded": {
                "portnum": "POSITION_APP",
                "position": { "latitude_i": 429_123_456i64, "longitude_i": -711_234_567i64 }
            }
        }));
        let pos = p.position().unwrap();
        assert!((pos.latitude - 42.9123456).abs() < 1e-6);
        assert!((pos.longitude - (-71.1234567)).abs() < 1e-6);
    }

    #[test]
    fn extracts_user_long_name() {
        let p = packet(json!({
            "fromId": "!abcd1234",
            "decoded": { "portnum": "NODEINFO_APP", "user": { "longName": "Test Node" } }
        }));
        assert_eq!(p.user_long_name().as_deref(), Some("Test Node"));
    }

    #[test]
    fn payload_tolerates_base64_string() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        let p = packet(json!({
            "decoded": { "portnum": "TEXT_MESSAGE_APP", "payload": encoded }
        }));
        assert_eq!(p.payload_text().as_deref(), Some("hello"));
    }

    #[test]
    fn missing_from_id_returns_none() {
        let p = packet(json!({ "decoded": {} }));
        assert_eq!(p.from_id(), None);
    }
}
