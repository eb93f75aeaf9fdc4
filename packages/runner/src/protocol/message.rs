// packages/runner/src/protocol/message.rs
//! Protocol message envelope
//!
//! On the wire a message is one line: a `~` followed by a JSON object whose
//! `type` field names the message and whose other fields are the payload.
//! Lines without the prefix are ordinary worker output.

use crate::utils::errors::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marks a line as a protocol message
pub const MESSAGE_PREFIX: char = '~';

/// A named message with an opaque structured payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub name: String,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field; the `type` key belongs to the envelope and is skipped
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.payload.insert(key, value.into());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Encode as a single protocol line (without the trailing newline)
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self).map_err(|e| ProtocolError::Encoding(e.to_string()))?;
        Ok(format!("{}{}", MESSAGE_PREFIX, json))
    }

    /// Decode a line; `None` when the line is not a protocol message at all
    pub fn decode(line: &str) -> Option<Result<Message, ProtocolError>> {
        let body = line.trim_end_matches(['\r', '\n']).strip_prefix(MESSAGE_PREFIX)?;
        Some(serde_json::from_str(body).map_err(|e| ProtocolError::Encoding(e.to_string())))
    }
}
