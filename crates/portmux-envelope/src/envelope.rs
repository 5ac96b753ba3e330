use portmux_transport::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::ChannelId;
use crate::error::Result;

/// Reserved payload terminating a channel. Never a legitimate payload value.
pub const CLOSE: &str = "__CLOSE__";

/// A framed protocol message.
///
/// Wire format:
/// ```text
/// { "id": "channel-…", "type": "<protocol name>", "payload": <any JSON> }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P = Value> {
    /// Correlation id shared by a request and all of its replies.
    pub id: ChannelId,
    /// Protocol name multiplexing independent protocols on one port.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message body.
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(id: ChannelId, kind: impl Into<String>, payload: P) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
        }
    }
}

impl<P: Serialize> Envelope<P> {
    /// Encode into the message posted on a port.
    pub fn to_message(&self) -> Result<Message> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Envelope<Value> {
    /// Build the envelope terminating channel `id`.
    pub fn close(id: ChannelId, kind: impl Into<String>) -> Self {
        Self::new(id, kind, Value::String(CLOSE.to_string()))
    }

    /// Whether this envelope carries the close sentinel.
    pub fn is_close(&self) -> bool {
        self.payload.as_str() == Some(CLOSE)
    }

    /// Read an envelope out of a raw port message.
    ///
    /// Anything that is not an object with a string `id` yields `None`.
    /// A missing `type` reads as the empty type, a missing payload as null.
    pub fn from_message(message: &Message) -> Option<Self> {
        let object = message.as_object()?;
        let id = object.get("id")?.as_str()?;
        let kind = object.get("type").and_then(Value::as_str).unwrap_or_default();
        let payload = object.get("payload").cloned().unwrap_or(Value::Null);
        Some(Self::new(ChannelId::from_raw(id), kind, payload))
    }

    /// Decode the payload into a concrete type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_shape_uses_type_field() {
        let envelope = Envelope::new(ChannelId::from("channel-1"), "first", "ping 1");
        assert_eq!(
            envelope.to_message().unwrap(),
            json!({"id": "channel-1", "type": "first", "payload": "ping 1"})
        );
    }

    #[test]
    fn close_envelope_is_detected() {
        let close = Envelope::close(ChannelId::from("channel-2"), "first");
        assert!(close.is_close());
        assert_eq!(close.payload, json!(CLOSE));

        let regular = Envelope::new(ChannelId::from("channel-2"), "first", json!("__close__"));
        assert!(!regular.is_close());
    }

    #[test]
    fn from_message_requires_string_id() {
        assert!(Envelope::from_message(&json!("__PING__")).is_none());
        assert!(Envelope::from_message(&json!({"id": 7, "type": "t"})).is_none());
        assert!(Envelope::from_message(&json!([1, 2])).is_none());
        assert!(Envelope::from_message(&json!({"type": "t"})).is_none());

        let envelope = Envelope::from_message(&json!({"id": "channel-3"})).unwrap();
        assert_eq!(envelope.kind, "");
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn message_round_trip_preserves_fields() {
        let sent = Envelope::new(
            ChannelId::from("channel-4"),
            "second",
            json!({"nested": [1, 2, 3]}),
        );
        let parsed = Envelope::from_message(&sent.to_message().unwrap()).unwrap();
        assert_eq!(parsed, sent);
    }

    #[test]
    fn decode_payload_reports_type_mismatch() {
        let envelope = Envelope::new(ChannelId::from("channel-5"), "t", json!("text"));
        assert_eq!(envelope.decode_payload::<String>().unwrap(), "text");
        assert!(envelope.decode_payload::<u32>().is_err());
    }
}
