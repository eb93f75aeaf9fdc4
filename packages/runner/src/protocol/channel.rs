// packages/runner/src/protocol/channel.rs
//! Capability-negotiated message channel
//!
//! A [`Protocol`] moves through `Unconnected -> Negotiating -> Open -> Closed`:
//!
//! ```text
//!  add_capability / register           start(transport)
//!  ───────────────────────── Unconnected ──────────────► Negotiating
//!                                                             │ peer announcement
//!                                                             ▼
//!          transport failure / close()  ◄─────────────────── Open
//!                      │
//!                      ▼
//!                    Closed (terminal)
//! ```
//!
//! Each side announces the message types it understands as soon as the
//! channel starts. A type is usable only once both sides have announced
//! it. Inbound messages are read by a dedicated task and dispatched to the
//! handler registered for their name; outbound messages go through a
//! bounded queue drained by a single writer task, which keeps concurrent
//! senders from interleaving and preserves send order.

use crate::protocol::capabilities::{self, Capabilities};
use crate::protocol::message::Message;
use crate::protocol::transport::{MessageSink, MessageStream, Transport};
use crate::utils::errors::ProtocolError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound messages buffered before senders feel backpressure
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Lifecycle of a protocol channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Unconnected,
    Negotiating,
    Open,
    Closed,
}

/// Which end of the channel this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Runner,
    Worker,
}

impl Role {
    /// Name of the announcement this side sends
    pub fn announcement(&self) -> &'static str {
        match self {
            Role::Runner => capabilities::WELCOME,
            Role::Worker => capabilities::HELLO,
        }
    }

    /// Name of the announcement expected from the peer
    pub fn peer_announcement(&self) -> &'static str {
        match self {
            Role::Runner => capabilities::HELLO,
            Role::Worker => capabilities::WELCOME,
        }
    }
}

/// Callback invoked for each inbound message of a registered type
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

struct Inner {
    role: Role,
    local: RwLock<Capabilities>,
    remote: RwLock<Option<Capabilities>>,
    handlers: DashMap<String, Handler>,
    state: watch::Sender<ProtocolState>,
    close_reason: Mutex<Option<ProtocolError>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a protocol channel; clones share the same channel
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Protocol {
    /// Create an unconnected channel with no capabilities
    pub fn new(role: Role) -> Self {
        let (state, _) = watch::channel(ProtocolState::Unconnected);
        Self {
            inner: Arc::new(Inner {
                role,
                local: RwLock::new(Capabilities::new()),
                remote: RwLock::new(None),
                handlers: DashMap::new(),
                state,
                close_reason: Mutex::new(None),
                outbound: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create an unconnected channel declaring the given capabilities
    pub fn with_capabilities(role: Role, local: Capabilities) -> Result<Self, ProtocolError> {
        let protocol = Self::new(role);
        for name in local.iter() {
            protocol.add_capability(name)?;
        }
        Ok(protocol)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ProtocolState {
        *self.inner.state.borrow()
    }

    /// Declare a message type this side understands
    ///
    /// Capabilities are announced when the channel starts, so they can only
    /// be added while it is still unconnected.
    pub fn add_capability(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        let name = name.into();
        if capabilities::is_reserved(&name) {
            return Err(ProtocolError::ReservedMessage { name });
        }
        match self.state() {
            ProtocolState::Unconnected => {
                self.inner.local.write().add(name);
                Ok(())
            }
            ProtocolState::Closed => Err(ProtocolError::ChannelClosed),
            _ => Err(ProtocolError::NegotiationFailed(format!(
                "capability '{}' added after the announcement was sent",
                name
            ))),
        }
    }

    pub fn local_capabilities(&self) -> Capabilities {
        self.inner.local.read().clone()
    }

    /// Capabilities the peer announced, once it has
    pub fn remote_capabilities(&self) -> Option<Capabilities> {
        self.inner.remote.read().clone()
    }

    /// True when both sides declared `name` and the channel is open
    pub fn capable(&self, name: &str) -> bool {
        self.state() == ProtocolState::Open && self.inner.jointly_declared(name)
    }

    /// Register the handler for inbound messages named `name`
    ///
    /// Only types this side declared may be handled, and only one handler
    /// per type. Registration is allowed before and after negotiation.
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> Result<(), ProtocolError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let name = name.into();
        if capabilities::is_reserved(&name) {
            return Err(ProtocolError::ReservedMessage { name });
        }
        if self.state() == ProtocolState::Closed {
            return Err(ProtocolError::ChannelClosed);
        }
        if !self.inner.local.read().contains(&name) {
            return Err(ProtocolError::UnsupportedCapability { name });
        }

        match self.inner.handlers.entry(name) {
            Entry::Occupied(entry) => Err(ProtocolError::DuplicateHandler {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!("Registered protocol handler for '{}'", entry.key());
                entry.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    /// Attach the transport, announce our capabilities and start the I/O tasks
    pub fn start(&self, transport: Transport) -> Result<(), ProtocolError> {
        let transitioned = self.inner.state.send_if_modified(|state| {
            if *state == ProtocolState::Unconnected {
                *state = ProtocolState::Negotiating;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(ProtocolError::NegotiationFailed(
                "protocol was already started".to_string(),
            ));
        }

        let (reader, writer) = transport.into_parts();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let announcement = self
            .inner
            .local
            .read()
            .announcement(self.inner.role.announcement());
        // The queue is empty and has capacity, so the announcement goes out first.
        tx.try_send(announcement)
            .map_err(|_| ProtocolError::ChannelClosed)?;
        *self.inner.outbound.lock() = Some(tx);

        let writer_task = tokio::spawn(write_loop(Arc::clone(&self.inner), writer, rx));
        let reader_task = tokio::spawn(read_loop(Arc::clone(&self.inner), reader));
        self.inner.tasks.lock().extend([reader_task, writer_task]);

        debug!("Protocol started as {:?}", self.inner.role);
        Ok(())
    }

    /// Send a message of a jointly declared type
    pub async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        if capabilities::is_reserved(&message.name) {
            return Err(ProtocolError::ReservedMessage { name: message.name });
        }
        match self.state() {
            ProtocolState::Closed => return Err(ProtocolError::ChannelClosed),
            ProtocolState::Unconnected | ProtocolState::Negotiating => {
                return Err(ProtocolError::NotNegotiated { name: message.name })
            }
            ProtocolState::Open => {}
        }
        if !self.inner.jointly_declared(&message.name) {
            return Err(ProtocolError::UnsupportedCapability { name: message.name });
        }

        let sender = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(ProtocolError::ChannelClosed)?;
        sender
            .send(message)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Wait until the channel is open
    ///
    /// Fails when the channel closes first, with the reason negotiation
    /// did not complete.
    pub async fn wait_for_open(&self) -> Result<(), ProtocolError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProtocolState::Open => return Ok(()),
                ProtocolState::Closed => {
                    return Err(self
                        .inner
                        .close_reason
                        .lock()
                        .clone()
                        .unwrap_or(ProtocolError::ChannelClosed))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ProtocolError::ChannelClosed);
            }
        }
    }

    /// Wait until the channel has closed for any reason
    pub async fn wait_for_close(&self) {
        let mut rx = self.inner.state.subscribe();
        while *rx.borrow_and_update() != ProtocolState::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Why the channel closed, when it closed abnormally
    pub fn close_reason(&self) -> Option<ProtocolError> {
        self.inner.close_reason.lock().clone()
    }

    /// Close the channel and stop its I/O tasks
    pub fn close(&self) {
        self.inner.shutdown(Closure::Local);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// What ended the channel
enum Closure {
    /// `close()` on this side
    Local,
    /// The transport reached end of stream
    PeerGone,
    Failed(ProtocolError),
}

impl Inner {
    fn jointly_declared(&self, name: &str) -> bool {
        self.local.read().contains(name)
            && self
                .remote
                .read()
                .as_ref()
                .map(|remote| remote.contains(name))
                .unwrap_or(false)
    }

    fn handle_inbound(&self, message: Message) {
        if message.name == self.role.peer_announcement() {
            self.accept_announcement(&message);
            return;
        }
        if capabilities::is_reserved(&message.name) {
            debug!("Ignoring unexpected '{}' announcement", message.name);
            return;
        }

        let state = *self.state.borrow();
        if state != ProtocolState::Open {
            debug!("Ignoring '{}' received before negotiation", message.name);
            return;
        }
        if !self.jointly_declared(&message.name) {
            debug!("Ignoring message of unnegotiated type '{}'", message.name);
            return;
        }

        let handler = self
            .handlers
            .get(&message.name)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler(message),
            None => debug!("No handler for '{}'", message.name),
        }
    }

    fn accept_announcement(&self, message: &Message) {
        let remote = match Capabilities::from_announcement(message) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Ignoring malformed capability announcement: {}", e);
                return;
            }
        };

        let joint = self.local.read().intersection(&remote);
        *self.remote.write() = Some(remote);

        let opened = self.state.send_if_modified(|state| {
            if *state == ProtocolState::Negotiating {
                *state = ProtocolState::Open;
                true
            } else {
                false
            }
        });
        if opened {
            info!(
                "Protocol open with capabilities: {:?}",
                joint.iter().collect::<Vec<_>>()
            );
        }
    }

    fn shutdown(&self, closure: Closure) {
        // Holding the reason slot serializes concurrent shutdowns from the
        // reader and writer tasks.
        let mut close_reason = self.close_reason.lock();
        let previous = *self.state.borrow();
        if previous == ProtocolState::Closed {
            return;
        }

        let reason = match (previous, closure) {
            (_, Closure::Local) => None,
            (ProtocolState::Negotiating, Closure::PeerGone) => Some(
                ProtocolError::NegotiationFailed("transport closed before the peer announced".into()),
            ),
            (ProtocolState::Negotiating, Closure::Failed(e)) => {
                Some(ProtocolError::NegotiationFailed(e.to_string()))
            }
            (_, Closure::PeerGone) => None,
            (_, Closure::Failed(e)) => Some(e),
        };
        if reason.is_some() {
            *close_reason = reason;
        }

        self.outbound.lock().take();
        self.state.send_replace(ProtocolState::Closed);
        debug!("Protocol closed (was {:?})", previous);
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: MessageStream) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(message) => inner.handle_inbound(message),
            Err(e) => {
                warn!("Protocol read failed: {}", e);
                inner.shutdown(Closure::Failed(e));
                return;
            }
        }
    }
    inner.shutdown(Closure::PeerGone);
}

async fn write_loop(inner: Arc<Inner>, mut writer: MessageSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(message).await {
            warn!("Protocol write failed: {}", e);
            inner.shutdown(Closure::Failed(e));
            return;
        }
    }
    let _ = writer.close().await;
}
