use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::Frame;

/// Control token telling the service that no more audio will follow
pub const END_OF_STREAM: &str = "EOS";

/// JSON message sent by the recognition service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    /// Finalized elements; shape is owned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ServiceMessage {
    /// Read the known fields one at a time, so a field of an unexpected
    /// type never hides the others. Non-object values yield an empty message.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).filter(|v| !v.is_null());

        Self {
            message_type: field("type").and_then(Value::as_str).map(str::to_owned),
            transcript: field("transcript").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            elements: field("elements").cloned(),
            error: field("error").cloned(),
        }
    }

    /// Error description, if the message carries a non-empty error payload
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null | Value::Bool(false) => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A decoded unit received from the service
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Service is ready to receive audio
    Connected,
    /// Interim transcript, may still be revised
    Partial {
        transcript: String,
        elements: Option<Value>,
    },
    /// Transcript the service will not revise
    Final {
        transcript: String,
        elements: Option<Value>,
    },
    ServiceError {
        message: String,
        raw: String,
    },
    Unrecognized {
        raw: String,
    },
    Malformed {
        raw: String,
        diagnostic: String,
    },
    UnexpectedBinary {
        len: usize,
    },
}

/// Decode one inbound frame.
///
/// A single message may carry both an error payload and a known `type`, so
/// this yields every message the frame implies, error first.
pub fn decode_frame(frame: &Frame) -> Vec<InboundMessage> {
    let raw = match frame {
        Frame::Binary(data) => return vec![InboundMessage::UnexpectedBinary { len: data.len() }],
        Frame::Text(text) => text,
    };

    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return vec![InboundMessage::Malformed {
                raw: raw.clone(),
                diagnostic: e.to_string(),
            }]
        }
    };

    let message = ServiceMessage::from_value(&value);

    let mut decoded = Vec::new();

    if let Some(message_text) = message.error_message() {
        decoded.push(InboundMessage::ServiceError {
            message: message_text,
            raw: raw.clone(),
        });
    }

    let transcript = message.transcript.unwrap_or_default();
    match message.message_type.as_deref() {
        Some("connected") => decoded.push(InboundMessage::Connected),
        Some("partial") => decoded.push(InboundMessage::Partial {
            transcript,
            elements: message.elements,
        }),
        Some("final") => decoded.push(InboundMessage::Final {
            transcript,
            elements: message.elements,
        }),
        _ => {
            if decoded.is_empty() {
                decoded.push(InboundMessage::Unrecognized { raw: raw.clone() });
            }
        }
    }

    decoded
}

/// Bytes pushed to the output side for a finalized message
pub fn output_payload(elements: &Value) -> Bytes {
    match elements {
        Value::String(s) => Bytes::from(s.clone()),
        other => Bytes::from(other.to_string()),
    }
}
