//! Typed payloads carried inside frames, selected by topic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{base64_bytes, Topic};
use crate::error::Result;

/// Multi-valued header map as it travels on the wire.
pub type Headers = HashMap<String, Vec<String>>;

/// Payload of a `request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestEnvelope {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Payload of a `response` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseEnvelope {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl HttpResponseEnvelope {
    /// Synthesized failure response with a JSON `{"error": ...}` body.
    pub fn error(status_code: u16, message: impl AsRef<str>) -> Self {
        let body = serde_json::json!({ "error": message.as_ref() });
        HttpResponseEnvelope {
            status_code,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                vec!["application/json".to_string()],
            )]),
            body: body.to_string().into_bytes(),
        }
    }
}

/// Payload of a `ping` message; `body` is `"ping"` or `"pong"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingEnvelope {
    pub body: String,
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub message: String,
}

/// A decoded payload. The variant is chosen by the enclosing frame's topic,
/// never inferred from the payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(HttpRequestEnvelope),
    Response(HttpResponseEnvelope),
    Ping(PingEnvelope),
    Error(ErrorEnvelope),
}

impl Envelope {
    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Envelope> {
        Ok(match topic {
            Topic::Request => Envelope::Request(serde_json::from_slice(payload)?),
            Topic::Response => Envelope::Response(serde_json::from_slice(payload)?),
            Topic::Ping => Envelope::Ping(serde_json::from_slice(payload)?),
            Topic::Error | Topic::Unknown => Envelope::Error(serde_json::from_slice(payload)?),
        })
    }
}

impl HttpRequestEnvelope {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl HttpResponseEnvelope {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl PingEnvelope {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
