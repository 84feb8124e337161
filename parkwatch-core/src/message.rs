//! Telemetry Messages and Device Topic Addressing
//!
//! ## Wire Format
//!
//! Field sensors publish JSON objects on device-scoped topics:
//!
//! ```text
//! topic:   things/<deviceId>/shadow/update
//! payload: {"appId":"TEMP","data":21.5,"messageType":"EVENT","ts":1700000000000}
//! ```
//!
//! - `appId` names the property or action (`TEMP`, `HUMID`, `BUTTON`, ...)
//! - `data` is any JSON value; scalar for sensor channels, object for actions
//! - `messageType` defaults to `EVENT` when omitted
//! - `ts` is optional, epoch milliseconds, set by the device
//!
//! Unknown message types still decode (as [`MessageType::Other`]) so that a
//! firmware update adding a new type doesn't turn into a flood of decode
//! errors.
//!
//! ## Topic Addressing
//!
//! A topic is device-scoped when one of its segments is `things` and the
//! following segment is non-empty. Anything before the marker is ignored, so
//! `$aws/things/dev1/shadow/update` and `things/dev1/events` both address
//! `dev1`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DecodeError;
use crate::time::Timestamp;

/// Segment marking the start of a device address in a topic
pub const THINGS_MARKER: &str = "things";

/// Application-level message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Sensor reading or physical action reported by the device
    #[default]
    Event,
    /// Configuration change pushed to the device
    CfgSet,
    /// Configuration read request
    CfgGet,
    /// Device acknowledgement of a configuration change
    CfgAck,
    /// Any type this gateway does not know about
    #[serde(other)]
    Other,
}

/// Decoded bus payload
///
/// Transient: exists for the duration of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Property or action identifier
    pub app_id: String,
    /// Scalar reading or structured action data
    #[serde(default)]
    pub data: Value,
    /// Application-level message type
    #[serde(default)]
    pub message_type: MessageType,
    /// Device-side timestamp in epoch milliseconds
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
}

impl TelemetryMessage {
    /// Create an `EVENT` message without a device timestamp
    pub fn new(app_id: impl Into<String>, data: Value) -> Self {
        Self {
            app_id: app_id.into(),
            data,
            message_type: MessageType::Event,
            ts: None,
        }
    }

    /// Set the message type
    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Set the device-side timestamp
    pub fn with_ts(mut self, ts: Timestamp) -> Self {
        self.ts = Some(ts);
        self
    }

    /// Decode a raw bus payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let message: Self = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if message.app_id.is_empty() {
            return Err(DecodeError::Malformed("appId is empty".into()));
        }

        Ok(message)
    }

    /// Serialize for publishing
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Whether this is a device-reported event
    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }

    /// Whether this is an event for the given `appId`
    pub fn is_event_for(&self, app_id: &str) -> bool {
        self.is_event() && self.app_id == app_id
    }
}

/// Device-scoped decomposition of a bus topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicAddress {
    device_id: String,
    segments: Vec<String>,
    marker: usize,
}

impl TopicAddress {
    /// Parse a topic, returning `None` if it is not device-scoped
    pub fn parse(topic: &str) -> Option<Self> {
        let segments: Vec<String> = topic.split('/').map(str::to_owned).collect();

        let marker = segments
            .windows(2)
            .position(|pair| pair[0] == THINGS_MARKER && !pair[1].is_empty())?;

        Some(Self {
            device_id: segments[marker + 1].clone(),
            segments,
            marker,
        })
    }

    /// Device identifier following the `things` marker
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// All topic segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segments after the device identifier (e.g. `["shadow", "update"]`)
    pub fn suffix(&self) -> &[String] {
        &self.segments[self.marker + 2..]
    }

    /// Rebuild the topic string
    pub fn topic(&self) -> String {
        self.segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_full_message() {
        let msg = TelemetryMessage::decode(
            br#"{"appId":"TEMP","data":21.5,"messageType":"EVENT","ts":1700000000000}"#,
        )
        .unwrap();

        assert_eq!(msg.app_id, "TEMP");
        assert_eq!(msg.data, json!(21.5));
        assert_eq!(msg.message_type, MessageType::Event);
        assert_eq!(msg.ts, Some(1_700_000_000_000));
    }

    #[test]
    fn decode_defaults() {
        let msg = TelemetryMessage::decode(br#"{"appId":"BUTTON","data":{}}"#).unwrap();
        assert_eq!(msg.message_type, MessageType::Event);
        assert_eq!(msg.ts, None);
        assert!(msg.is_event_for("BUTTON"));
    }

    #[test]
    fn decode_unknown_type() {
        let msg = TelemetryMessage::decode(br#"{"appId":"FW","messageType":"OTA_PROGRESS"}"#)
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Other);
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn decode_cfg_set() {
        let msg = TelemetryMessage::decode(br#"{"appId":"LED","data":"on","messageType":"CFG_SET"}"#)
            .unwrap();
        assert_eq!(msg.message_type, MessageType::CfgSet);
        assert!(!msg.is_event());
    }

    #[test]
    fn decode_failures() {
        assert_eq!(TelemetryMessage::decode(b""), Err(DecodeError::Empty));
        assert_eq!(TelemetryMessage::decode(b"  \n"), Err(DecodeError::Empty));
        assert!(matches!(
            TelemetryMessage::decode(b"{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            TelemetryMessage::decode(br#"{"data":1}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            TelemetryMessage::decode(br#"{"appId":""}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn payload_uses_wire_names() {
        let msg = TelemetryMessage::new("LED", json!("on"))
            .with_type(MessageType::CfgSet)
            .with_ts(5);
        let value: Value = serde_json::from_slice(&msg.to_payload().unwrap()).unwrap();

        assert_eq!(value, json!({"appId":"LED","data":"on","messageType":"CFG_SET","ts":5}));
    }

    #[test]
    fn topic_address() {
        let addr = TopicAddress::parse("things/dev1/shadow/update").unwrap();
        assert_eq!(addr.device_id(), "dev1");
        assert_eq!(addr.suffix(), ["shadow", "update"]);
        assert_eq!(addr.topic(), "things/dev1/shadow/update");

        let prefixed = TopicAddress::parse("$aws/things/dev-9/events").unwrap();
        assert_eq!(prefixed.device_id(), "dev-9");
        assert_eq!(prefixed.segments().len(), 4);
    }

    #[test]
    fn topic_not_device_scoped() {
        assert!(TopicAddress::parse("sensors/dev1/temp").is_none());
        assert!(TopicAddress::parse("things").is_none());
        assert!(TopicAddress::parse("things//update").is_none());
        assert!(TopicAddress::parse("").is_none());
    }
}
