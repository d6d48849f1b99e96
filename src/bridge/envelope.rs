//! Gateway stamping: turns a decoded radio packet into the JSON envelope
//! published to MQTT, and builds the differently-shaped self-echo envelope
//! used when a reverse-path send is correlated with its own RF echo.

use serde_json::{json, Value};

use crate::packet::DecodedPacket;

/// Per-gateway facts stamped onto every outgoing envelope.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub gateway_id: String,
    pub modem_preset: String,
    pub channel_num: u32,
}

/// Copies every decoded field and adds `gatewayId`, `source`, `modem_preset`,
/// `channel_num`.
pub fn build_gateway_envelope(packet: &DecodedPacket, ctx: &GatewayContext) -> Value {
    let mut map = packet.0.clone();
    map.insert("gatewayId".to_string(), json!(ctx.gateway_id));
    map.insert("source".to_string(), json!("rf"));
    map.insert("modem_preset".to_string(), json!(ctx.modem_preset));
    map.insert("channel_num".to_string(), json!(ctx.channel_num));
    Value::Object(map)
}

/// `{ packet: { id, fromId, toId, rxTime, decoded: { portnum, payload } }, gatewayId, channelId }`,
/// used for both the correlated echo (real packet id) and the fallback echo
/// (locally generated id).
pub fn build_echo_envelope(
    packet_id: u32,
    from_id: &str,
    to_id: Option<&str>,
    rx_time: i64,
    text: &str,
    gateway_id: &str,
    channel_id: u32,
) -> Value {
    json!({
        "packet": {
            "id": packet_id,
            "fromId": from_id,
            "toId": to_id,
            "rxTime": rx_time,
            "decoded": {
                "portnum": "TEXT_MESSAGE_APP",
                "payload": text,
            },
        },
        "gatewayId": gateway_id,
        "channelId": channel_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gateway_envelope_preserves_fields_and_adds_stamps() {
        let packet = DecodedPacket::from_map(
            json!({ "fromId": "!abcd1234", "decoded": { "portnum": "TEXT_MESSAGE_APP" } })
                .as_object()
                .unwrap()
                .clone(),
        );
        let ctx = GatewayContext {
            gateway_id: "!00000001".into(),
            modem_preset: "LONG_FAST".into(),
            channel_num: 0,
        };
        let envelope = build_gateway_envelope(&packet, &ctx);
        assert_eq!(envelope["fromId"], "!abcd1234");
        assert_eq!(envelope["gatewayId"], "!00000001");
        assert_eq!(envelope["source"], "rf");
        assert_eq!(envelope["modem_preset"], "LONG_FAST");
        assert_eq!(envelope["channel_num"], 0);
    }

    #[test]
    fn echo_envelope_has_expected_shape() {
        let envelope = build_echo_envelope(42, "!00000001", None, 1000, "hi", "!00000001", 0);
        assert_eq!(envelope["packet"]["id"], 42);
        assert_eq!(envelope["packet"]["decoded"]["portnum"], "TEXT_MESSAGE_APP");
        assert_eq!(envelope["packet"]["decoded"]["payload"], "hi");
        assert_eq!(envelope["gatewayId"], "!00000001");
    }
}
