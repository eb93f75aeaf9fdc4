// packages/runner/src/protocol/mod.rs
//! Runner ↔ worker message channel
//!
//! - **Message**: `{type, ...payload}` envelope and its line encoding
//! - **Capabilities**: capability sets and the well-known message types
//! - **Transport**: duplex stream/sink of messages over any byte stream
//! - **Channel**: the negotiated [`Protocol`] with handler dispatch
//!
//! # Wire format
//!
//! ```text
//! runner → worker   ~{"type":"welcome","capabilities":["graceful-termination","log",...]}
//! worker → runner   ~{"type":"hello","capabilities":["log",...]}
//! worker → runner   ordinary output line (not a message)
//! worker → runner   ~{"type":"log","body":{"msg":"claimed task"}}
//! ```

pub mod capabilities;
pub mod channel;
pub mod message;
pub mod transport;

pub use capabilities::Capabilities;
pub use channel::{Handler, Protocol, ProtocolState, Role};
pub use message::Message;
pub use transport::{MessageSink, MessageStream, OutputLine, OutputLineCodec, Transport};
