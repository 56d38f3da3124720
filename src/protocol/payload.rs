//! Envelope and control payload codec

use super::OpCode;
use crate::error::GatewayError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::{Intents, ShardId};

/// Dispatch event that opens a session
pub const READY_EVENT: &str = "READY";

/// Dispatch event that confirms a resumed session
pub const RESUMED_EVENT: &str = "RESUMED";

/// Inbound gateway envelope.
///
/// `d` is kept as raw JSON so dispatch bodies can be forwarded without a
/// decode/encode cycle.
#[derive(Debug, Deserialize)]
pub struct Payload {
    pub op: u64,
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl Payload {
    /// Decode an envelope from one inbound frame
    pub fn from_slice(frame: &[u8]) -> Result<Self, GatewayError> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Known opcode, or None for opcodes this client does not handle
    pub fn opcode(&self) -> Option<OpCode> {
        u8::try_from(self.op).ok().and_then(OpCode::from_u8)
    }

    /// Event name of a dispatch frame ("" when absent)
    pub fn event_name(&self) -> &str {
        self.t.as_deref().unwrap_or_default()
    }

    /// Raw JSON text of `d` (`null` when absent)
    pub fn raw_data(&self) -> &str {
        self.d.as_deref().map_or("null", RawValue::get)
    }

    /// Decode `d` into a control payload
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        Ok(serde_json::from_str(self.raw_data())?)
    }
}

#[derive(Serialize)]
struct Outbound<'a, T> {
    op: u8,
    d: &'a T,
}

/// Encode an outbound frame
pub fn encode<T: Serialize>(op: OpCode, data: &T) -> Result<String, GatewayError> {
    Ok(serde_json::to_string(&Outbound { op: op.as_u8(), d: data })?)
}

/// Hello (op 10) body
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// Client properties sent with Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify (op 2) body
#[derive(Debug, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub properties: &'a IdentifyProperties,
    pub large_threshold: u64,
    pub compress: bool,
    pub shard: ShardId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<&'a UpdatePresencePayload>,
    pub intents: Intents,
}

/// Resume (op 6) body
#[derive(Debug, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// Fields of the READY dispatch this client keeps
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn decodes_dispatch_envelope() {
        let frame = br#"{"op":0,"d":{"session_id":"abc"},"s":42,"t":"READY"}"#;
        let payload = Payload::from_slice(frame).unwrap();

        assert_eq!(payload.opcode(), Some(OpCode::Dispatch));
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.event_name(), "READY");
        assert_eq!(payload.raw_data(), r#"{"session_id":"abc"}"#);

        let ready: Ready = payload.data().unwrap();
        assert_eq!(ready.session_id, "abc");
        assert!(ready.resume_gateway_url.is_none());
    }

    #[test]
    fn null_and_missing_fields_decode_as_absent() {
        let payload = Payload::from_slice(br#"{"op":11,"d":null,"s":null,"t":null}"#).unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::HeartbeatAck));
        assert!(payload.s.is_none());
        assert_eq!(payload.event_name(), "");
        assert_eq!(payload.raw_data(), "null");

        let payload = Payload::from_slice(br#"{"op":7}"#).unwrap();
        assert_eq!(payload.opcode(), Some(OpCode::Reconnect));
        assert!(payload.d.is_none());
    }

    #[test]
    fn unknown_opcode_still_decodes() {
        let payload = Payload::from_slice(br#"{"op":42,"d":{}}"#).unwrap();
        assert_eq!(payload.op, 42);
        assert_eq!(payload.opcode(), None);

        // wider than any known opcode, including values whose low byte is known
        let payload = Payload::from_slice(br#"{"op":267,"d":null}"#).unwrap();
        assert_eq!(payload.op, 267);
        assert_eq!(payload.opcode(), None);
    }

    #[test]
    fn malformed_envelope_is_decode_error() {
        let err = Payload::from_slice(b"{\"op\":").unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));

        let payload = Payload::from_slice(br#"{"op":10,"d":{"interval":5}}"#).unwrap();
        assert!(matches!(payload.data::<Hello>(), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn encodes_identify_frame() {
        let properties = IdentifyProperties {
            os: "linux".to_string(),
            browser: "test".to_string(),
            device: "test".to_string(),
        };
        let identify = Identify {
            token: "Bot t0ken",
            properties: &properties,
            large_threshold: 250,
            compress: false,
            shard: ShardId::new(1, 4),
            presence: None,
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
        };

        let frame: Value = serde_json::from_str(&encode(OpCode::Identify, &identify).unwrap()).unwrap();
        assert_eq!(frame["op"], 2);
        assert_eq!(frame["d"]["token"], "Bot t0ken");
        assert_eq!(frame["d"]["shard"], json!([1, 4]));
        assert_eq!(frame["d"]["intents"], 3);
        assert_eq!(frame["d"]["properties"]["os"], "linux");
        assert!(frame["d"].get("presence").is_none());
        assert!(frame.get("s").is_none());
        assert!(frame.get("t").is_none());
    }

    #[test]
    fn encodes_resume_and_heartbeat_frames() {
        let resume = Resume { token: "t", session_id: "abc", seq: 17 };
        let frame: Value = serde_json::from_str(&encode(OpCode::Resume, &resume).unwrap()).unwrap();
        assert_eq!(frame, json!({"op": 6, "d": {"token": "t", "session_id": "abc", "seq": 17}}));

        let frame = encode(OpCode::Heartbeat, &Option::<u64>::None).unwrap();
        assert_eq!(frame, r#"{"op":1,"d":null}"#);
        let frame = encode(OpCode::Heartbeat, &Some(5u64)).unwrap();
        assert_eq!(frame, r#"{"op":1,"d":5}"#);
    }
}
