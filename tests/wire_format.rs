//! Wire format conformance tests
//!
//! Checks outbound control frames and the published event envelope against
//! the field layout the gateway and downstream consumers expect, and that
//! captured inbound frames decode, including zlib-compressed ones.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use shard_gateway::dispatch::EventEnvelope;
use shard_gateway::protocol::{encode, Hello, Identify, IdentifyProperties, OpCode, Payload, Ready, Resume};
use shard_gateway::transport::inflate;
use std::io::Write;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::presence::Status;
use twilight_model::gateway::{Intents, ShardId};

/// Frames as captured from a live gateway session.
const CAPTURED_FRAMES: &[(&str, &str)] = &[
    ("hello", r#"{"t":null,"s":null,"op":10,"d":{"heartbeat_interval":41250,"_trace":["[\"gateway-prd-us-east1-b-0568\",{\"micros\":0.0}]"]}}"#),
    ("ready", r#"{"t":"READY","s":1,"op":0,"d":{"v":10,"user":{"id":"1","username":"bot"},"session_type":"normal","session_id":"9a3c7f0e5d","resume_gateway_url":"wss://gateway-us-east1-b.discord.gg","shard":[0,1],"guilds":[{"id":"123456789012345678","unavailable":true}]}}"#),
    ("heartbeat-ack", r#"{"t":null,"s":null,"op":11,"d":null}"#),
    ("invalid-session", r#"{"t":null,"s":null,"op":9,"d":false}"#),
    ("reconnect", r#"{"t":null,"s":null,"op":7,"d":null}"#),
];

/// Required fields of an Identify body.
const REQUIRED_IDENTIFY_FIELDS: &[&str] = &[
    "token",
    "properties",
    "large_threshold",
    "compress",
    "shard",
    "presence",
    "intents",
];

/// Required envelope fields for every published event.
const REQUIRED_ENVELOPE_FIELDS: &[&str] = &["event_id", "event_type", "timestamp", "data"];

fn frame(name: &str) -> &'static str {
    CAPTURED_FRAMES
        .iter()
        .find(|(frame, _)| *frame == name)
        .map(|(_, raw)| *raw)
        .unwrap_or_else(|| panic!("Unknown frame: {name}"))
}

fn deflate(raw: &str) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn captured_frames_decode() {
    for (name, raw) in CAPTURED_FRAMES {
        let payload = Payload::from_slice(raw.as_bytes())
            .unwrap_or_else(|e| panic!("Frame '{name}' failed to decode: {e}"));
        assert!(payload.opcode().is_some(), "Frame '{name}' has an unknown opcode");
    }

    let hello: Hello = Payload::from_slice(frame("hello").as_bytes()).unwrap().data().unwrap();
    assert_eq!(hello.heartbeat_interval, 41250);

    let ready = Payload::from_slice(frame("ready").as_bytes()).unwrap();
    assert_eq!(ready.s, Some(1));
    let ready: Ready = ready.data().unwrap();
    assert_eq!(ready.session_id, "9a3c7f0e5d");
    assert_eq!(
        ready.resume_gateway_url.as_deref(),
        Some("wss://gateway-us-east1-b.discord.gg")
    );
}

#[test]
fn compressed_frames_inflate_to_the_same_payload() {
    for (name, raw) in CAPTURED_FRAMES {
        let inflated = inflate(&deflate(raw)).unwrap();
        assert_eq!(inflated, raw.as_bytes(), "Frame '{name}' changed through zlib");
    }
}

#[test]
fn identify_has_required_fields() {
    let properties = IdentifyProperties::default();
    let presence = UpdatePresencePayload {
        activities: Vec::new(),
        afk: false,
        since: None,
        status: Status::Online,
    };
    let identify = Identify {
        token: "t0ken",
        properties: &properties,
        large_threshold: 250,
        compress: false,
        shard: ShardId::new(3, 16),
        presence: Some(&presence),
        intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
    };

    let frame: Value = serde_json::from_str(&encode(OpCode::Identify, &identify).unwrap()).unwrap();
    assert_eq!(frame["op"], 2);

    let body = frame["d"].as_object().expect("identify body should be an object");
    for field in REQUIRED_IDENTIFY_FIELDS {
        assert!(body.contains_key(*field), "Identify missing required field '{field}'");
    }
    assert_eq!(body["shard"], json!([3, 16]));
    assert_eq!(body["presence"]["status"], "online");
    assert_eq!(body["presence"]["activities"], json!([]));
    for key in ["os", "browser", "device"] {
        assert!(body["properties"][key].is_string(), "properties.{key} should be a string");
    }
}

#[test]
fn resume_and_heartbeat_frames_match_protocol() {
    let resume = Resume {
        token: "t0ken",
        session_id: "9a3c7f0e5d",
        seq: 1337,
    };
    let frame: Value = serde_json::from_str(&encode(OpCode::Resume, &resume).unwrap()).unwrap();
    assert_eq!(
        frame,
        json!({"op": 6, "d": {"token": "t0ken", "session_id": "9a3c7f0e5d", "seq": 1337}})
    );

    assert_eq!(encode(OpCode::Heartbeat, &Some(1337u64)).unwrap(), r#"{"op":1,"d":1337}"#);
    assert_eq!(encode(OpCode::Heartbeat, &None::<u64>).unwrap(), r#"{"op":1,"d":null}"#);
}

#[test]
fn envelope_has_required_fields_and_verbatim_data() {
    let payload = Payload::from_slice(frame("ready").as_bytes()).unwrap();
    let envelope = EventEnvelope::new(payload.event_name(), payload.raw_data().as_bytes()).unwrap();
    let published = serde_json::to_string(&envelope).unwrap();

    let obj: Value = serde_json::from_str(&published).unwrap();
    for field in REQUIRED_ENVELOPE_FIELDS {
        assert!(
            obj.get(*field).is_some(),
            "Envelope missing required field '{field}'"
        );
    }
    assert_eq!(obj["event_type"], "READY");
    uuid::Uuid::parse_str(obj["event_id"].as_str().unwrap()).unwrap();

    // dispatch bodies are forwarded byte-for-byte, never re-encoded
    assert!(published.contains(payload.raw_data()));
}
