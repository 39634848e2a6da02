//! Wire protocol: tagged frames, typed payload envelopes, chunking.
//!
//! Every WebSocket text frame carries one JSON [`Frame`]. Payloads larger
//! than the configured chunk size are split across frames sharing an `id`
//! and reassembled by [`chunk::Reassembler`] before dispatch.

mod chunk;
mod envelope;

pub use chunk::{split, Reassembler, DEFAULT_CHUNK_SIZE};
pub use envelope::{
    Envelope, ErrorEnvelope, Headers, HttpRequestEnvelope, HttpResponseEnvelope, PingEnvelope,
};

use std::fmt;
use std::fmt::Write as _;

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Dispatch tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Request,
    Response,
    Ping,
    Error,
    /// Topics this build does not know. Decoded, logged, and dropped rather
    /// than treated as a malformed frame.
    #[serde(other)]
    Unknown,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Request => "request",
            Topic::Response => "response",
            Topic::Ping => "ping",
            Topic::Error => "error",
            Topic::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One WebSocket text frame. `type` mirrors `topic` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: Topic,
    pub id: String,
    pub topic: Topic,
    /// 1-based chunk position.
    #[serde(rename = "chunk")]
    pub chunk_index: u32,
    /// Total number of chunks for this `id`.
    #[serde(rename = "total")]
    pub total_chunks: u32,
    #[serde(rename = "isChunk")]
    pub is_chunk: bool,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Frame> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub topic: Topic,
    pub payload: Bytes,
}

/// Opaque message token, unique within a session: `msg_` + 16 hex chars.
pub fn message_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    let mut id = String::with_capacity(20);
    id.push_str("msg_");
    for byte in raw {
        write!(id, "{byte:02x}").expect("writing to a String cannot fail");
    }
    id
}

/// Serde adapter: byte payloads travel base64-encoded inside JSON strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_preserves_payload_bytes() {
        let frame = Frame {
            kind: Topic::Request,
            id: message_id(),
            topic: Topic::Request,
            chunk_index: 1,
            total_chunks: 1,
            is_chunk: false,
            payload: vec![0, 159, 146, 150, 255],
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn wire_field_names_match_the_protocol() {
        let frame = Frame {
            kind: Topic::Ping,
            id: "msg_0011223344556677".to_string(),
            topic: Topic::Ping,
            chunk_index: 2,
            total_chunks: 3,
            is_chunk: true,
            payload: b"pong".to_vec(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["topic"], "ping");
        assert_eq!(json["chunk"], 2);
        assert_eq!(json["total"], 3);
        assert_eq!(json["isChunk"], true);
        assert_eq!(json["payload"], "cG9uZw==");
    }

    #[test]
    fn unknown_topic_decodes_instead_of_failing() {
        let text = r#"{"type":"metrics","id":"msg_x","topic":"metrics",
                       "chunk":1,"total":1,"isChunk":false,"payload":""}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.topic, Topic::Unknown);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(Frame::decode("{not json").is_err());
    }

    #[test]
    fn message_ids_are_short_and_distinct() {
        let a = message_id();
        let b = message_id();
        assert!(a.starts_with("msg_"));
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }
}
