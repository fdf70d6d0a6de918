//! Observer registry for connection and message events.
//!
//! Observers are invoked synchronously from inside [`MinimalClient::tick`],
//! `send_text` and `cleanup`, in the order events happen.
//!
//! [`MinimalClient::tick`]: crate::MinimalClient::tick

use crate::connection::ConnectionId;
use crate::error::FrameError;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Why a connection failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The peer refused the handshake or answered with something unusable
    HandshakeFailure(String),
    /// Nothing was heard from the peer within the timeout
    Timeout,
    /// The transport refused to send
    Transport(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeFailure(reason) => write!(f, "handshake failed: {reason}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

/// Receiver of client events.
///
/// A connection reports exactly one terminal event: `on_connection_failed`
/// for timeouts and handshake failures, or `on_disconnected` for an orderly
/// close from either side.
pub trait EventSink: Send {
    /// A whole text message arrived on a connection's Text channel
    fn on_text_received(&mut self, text: &str, connection: ConnectionId);

    /// A connection completed its handshake
    fn on_connected(&mut self, connection: ConnectionId);

    /// A connection failed and is now closed
    fn on_connection_failed(&mut self, connection: ConnectionId, reason: &FailureReason);

    /// A connection closed in an orderly way
    fn on_disconnected(&mut self, connection: ConnectionId);

    /// A whole message arrived on the Control channel
    fn on_control_received(&mut self, _connection: ConnectionId, _payload: &[u8]) {}

    /// A packet or text payload could not be decoded; the connection stays open
    fn on_decode_error(&mut self, _connection: ConnectionId, _error: &FrameError) {}
}

/// Owned copy of an event, for forwarding across threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// See [`EventSink::on_text_received`]
    TextReceived {
        /// Connection the text arrived on
        connection: ConnectionId,
        /// Message text
        text: String,
    },
    /// See [`EventSink::on_connected`]
    Connected(ConnectionId),
    /// See [`EventSink::on_connection_failed`]
    ConnectionFailed {
        /// Failed connection
        connection: ConnectionId,
        /// Failure cause
        reason: FailureReason,
    },
    /// See [`EventSink::on_disconnected`]
    Disconnected(ConnectionId),
    /// See [`EventSink::on_control_received`]
    ControlReceived {
        /// Connection the message arrived on
        connection: ConnectionId,
        /// Raw control payload
        payload: Vec<u8>,
    },
    /// See [`EventSink::on_decode_error`]
    DecodeError {
        /// Connection the bad data arrived on
        connection: ConnectionId,
        /// What was wrong with it
        error: FrameError,
    },
}

impl NetEvent {
    /// Connection the event concerns
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::TextReceived { connection, .. }
            | Self::ConnectionFailed { connection, .. }
            | Self::ControlReceived { connection, .. }
            | Self::DecodeError { connection, .. } => *connection,
            Self::Connected(connection) | Self::Disconnected(connection) => *connection,
        }
    }
}

/// Collects owned events, for tests and polling callers
impl EventSink for Vec<NetEvent> {
    fn on_text_received(&mut self, text: &str, connection: ConnectionId) {
        self.push(NetEvent::TextReceived {
            connection,
            text: text.to_string(),
        });
    }

    fn on_connected(&mut self, connection: ConnectionId) {
        self.push(NetEvent::Connected(connection));
    }

    fn on_connection_failed(&mut self, connection: ConnectionId, reason: &FailureReason) {
        self.push(NetEvent::ConnectionFailed {
            connection,
            reason: reason.clone(),
        });
    }

    fn on_disconnected(&mut self, connection: ConnectionId) {
        self.push(NetEvent::Disconnected(connection));
    }

    fn on_control_received(&mut self, connection: ConnectionId, payload: &[u8]) {
        self.push(NetEvent::ControlReceived {
            connection,
            payload: payload.to_vec(),
        });
    }

    fn on_decode_error(&mut self, connection: ConnectionId, error: &FrameError) {
        self.push(NetEvent::DecodeError {
            connection,
            error: error.clone(),
        });
    }
}

/// Forwards events into a tokio channel. A dropped receiver discards events.
impl EventSink for UnboundedSender<NetEvent> {
    fn on_text_received(&mut self, text: &str, connection: ConnectionId) {
        let _ = self.send(NetEvent::TextReceived {
            connection,
            text: text.to_string(),
        });
    }

    fn on_connected(&mut self, connection: ConnectionId) {
        let _ = self.send(NetEvent::Connected(connection));
    }

    fn on_connection_failed(&mut self, connection: ConnectionId, reason: &FailureReason) {
        let _ = self.send(NetEvent::ConnectionFailed {
            connection,
            reason: reason.clone(),
        });
    }

    fn on_disconnected(&mut self, connection: ConnectionId) {
        let _ = self.send(NetEvent::Disconnected(connection));
    }

    fn on_control_received(&mut self, connection: ConnectionId, payload: &[u8]) {
        let _ = self.send(NetEvent::ControlReceived {
            connection,
            payload: payload.to_vec(),
        });
    }

    fn on_decode_error(&mut self, connection: ConnectionId, error: &FrameError) {
        let _ = self.send(NetEvent::DecodeError {
            connection,
            error: error.clone(),
        });
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of events to every subscribed sink, in subscription order
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<(SubscriptionId, Box<dyn EventSink>)>,
    next_id: u64,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.sinks.push((id, sink));
        id
    }

    /// Remove a sink, returning whether it was registered
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|(sink_id, _)| *sink_id != id);
        self.sinks.len() != before
    }

    /// Number of registered sinks
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(&mut self, mut f: impl FnMut(&mut dyn EventSink)) {
        for (_, sink) in &mut self.sinks {
            f(sink.as_mut());
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for EventBus {
    fn on_text_received(&mut self, text: &str, connection: ConnectionId) {
        self.each(|sink| sink.on_text_received(text, connection));
    }

    fn on_connected(&mut self, connection: ConnectionId) {
        self.each(|sink| sink.on_connected(connection));
    }

    fn on_connection_failed(&mut self, connection: ConnectionId, reason: &FailureReason) {
        self.each(|sink| sink.on_connection_failed(connection, reason));
    }

    fn on_disconnected(&mut self, connection: ConnectionId) {
        self.each(|sink| sink.on_disconnected(connection));
    }

    fn on_control_received(&mut self, connection: ConnectionId, payload: &[u8]) {
        self.each(|sink| sink.on_control_received(connection, payload));
    }

    fn on_decode_error(&mut self, connection: ConnectionId, error: &FrameError) {
        self.each(|sink| sink.on_decode_error(connection, error));
    }
}
