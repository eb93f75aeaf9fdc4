// packages/runner/src/protocol/capabilities.rs
//! Capability sets and the well-known message types

use crate::protocol::message::Message;
use crate::utils::errors::ProtocolError;
use serde_json::Value;
use std::collections::BTreeSet;

/// Announcement sent by the runner
pub const WELCOME: &str = "welcome";

/// Announcement sent by the worker
pub const HELLO: &str = "hello";

/// Runner asks the worker to stop, optionally finishing running tasks
pub const GRACEFUL_TERMINATION: &str = "graceful-termination";

/// Runner hands the worker a refreshed credential bundle
pub const NEW_CREDENTIALS: &str = "new-credentials";

/// Worker emits a structured log line
pub const LOG: &str = "log";

/// Worker reports an error it could not handle itself
pub const ERROR_REPORT: &str = "error-report";

/// True for the names used by capability announcement
pub fn is_reserved(name: &str) -> bool {
    name == WELCOME || name == HELLO
}

/// A set of message-type names one side understands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities the runner itself understands
    pub fn runner_defaults() -> Self {
        [GRACEFUL_TERMINATION, NEW_CREDENTIALS, LOG, ERROR_REPORT]
            .into_iter()
            .collect()
    }

    pub fn add(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Names present in both sets
    pub fn intersection(&self, other: &Capabilities) -> Capabilities {
        Capabilities(self.0.intersection(&other.0).cloned().collect())
    }

    /// Build the announcement message carrying this set
    pub fn announcement(&self, name: &str) -> Message {
        let list: Vec<Value> = self.0.iter().cloned().map(Value::String).collect();
        Message::new(name).with("capabilities", list)
    }

    /// Read the set out of a peer's announcement
    ///
    /// A missing list means the peer supports nothing beyond the handshake.
    pub fn from_announcement(message: &Message) -> Result<Self, ProtocolError> {
        let list = match message.get("capabilities") {
            None | Some(Value::Null) => return Ok(Self::new()),
            Some(Value::Array(list)) => list,
            Some(other) => {
                return Err(ProtocolError::Encoding(format!(
                    "'{}' capabilities must be a list, got {}",
                    message.name, other
                )))
            }
        };

        list.iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ProtocolError::Encoding(format!(
                        "'{}' capability names must be strings, got {}",
                        message.name, item
                    ))
                })
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Capabilities(iter.into_iter().map(Into::into).collect())
    }
}
