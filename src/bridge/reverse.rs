//! MQTT → radio reverse path: decode `{text, to?}` ingress payloads and
//! transmit on both channel 0 and 1 (dual-channel compatibility, preserved
//! from the original as a configurable-but-defaulted-on behaviour).

use serde::Deserialize;
use tracing::warn;

use crate::radio::{RadioClient, RadioError};

use super::pending::PendingSendTable;

#[derive(Debug, Deserialize)]
struct ReverseMessage {
    text: String,
    to: Option<String>,
}

/// Parses the reverse-path payload, dropping (and logging) anything that
/// isn't valid JSON or carries an empty `text`.
pub fn parse_reverse_payload(bytes: &[u8]) -> Option<(String, Option<String>)> {
    let msg: ReverseMessage = match serde_json::from_slice(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "reverse-path payload is not valid json, dropping");
            return None;
        }
    };
    if msg.text.is_empty() {
        warn!("reverse-path payload has empty text, dropping");
        return None;
    }
    Some((msg.text, msg.to))
}

/// Sends on both channel 0 and 1, registers a [`PendingSend`](super::pending::PendingSend)
/// keyed by `(text, to)` using channel 0's locally generated packet id as
/// the correlation/fallback id.
pub async fn send_dual_channel(
    radio: &RadioClient,
    pending: &PendingSendTable,
    text: &str,
    to: Option<&str>,
) -> Result<(), RadioError> {
    let primary_id = radio.send_text(to, text, 0).await?;
    pending.register(text.to_string(), to.map(str::to_string), primary_id);
    radio.send_text(to, text, 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_payload() {
        let (text, to) = parse_reverse_payload(br#"{"text":"hi","to":"!abcd1234"}"#).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(to.as_deref(), Some("!abcd1234"));
    }

    #[test]
    fn parses_broadcast_payload_without_to() {
        let (text, to) = parse_reverse_payload(br#"{"text":"hi"}"#).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(to, None);
    }

    #[test]
    fn rejects_empty_text() {
        assert!(parse_reverse_payload(br#"{"text":""}"#).is_none());
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_reverse_payload(b"not json").is_none());
    }
}
