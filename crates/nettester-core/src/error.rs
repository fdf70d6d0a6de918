//! Error types for the NetTester core protocol.

use crate::connection::HandshakeState;
use crate::environment::ContextHandle;
use nettester_transport::TransportError;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session manager error
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Packet-level decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Packet ended before a fixed-size field
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Declared length runs past the end of the buffer
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthOverflow {
        /// Length declared by the prefix
        declared: u64,
        /// Bytes actually remaining
        remaining: usize,
    },

    /// Varint longer than 10 bytes or larger than u64
    #[error("varint overflow")]
    VarintOverflow,

    /// Varint value does not fit the field it encodes
    #[error("{field} out of range: {value}")]
    FieldOutOfRange {
        /// Field name
        field: &'static str,
        /// Decoded value
        value: u64,
    },

    /// Byte-order flag other than 0 or 1
    #[error("invalid byte order flag: {0}")]
    InvalidByteOrder(u8),

    /// Reserved flag bits set
    #[error("invalid frame flags: 0b{0:08b}")]
    InvalidFlags(u8),

    /// Bytes left after a complete packet
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// Text payload is not UTF-8
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// Declared length above the protocol maximum
    #[error("declared length {0} exceeds maximum payload size")]
    PayloadTooLarge(u64),
}

impl FrameError {
    /// Structural damage (a malformed frame) as opposed to a content decode failure
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::InvalidUtf8)
    }
}

/// Channel-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Channel index already registered on the connection
    #[error("channel {0} already registered")]
    AlreadyRegistered(u16),

    /// Send attempted before the connection completed its handshake
    #[error("channel {0} is not open")]
    ChannelNotOpen(u16),

    /// No channel registered at this index
    #[error("unknown channel: {0}")]
    UnknownChannel(u16),

    /// Unreliable payload larger than a single frame
    #[error("payload of {size} bytes exceeds frame limit of {limit}")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Largest single-frame payload
        limit: usize,
    },
}

/// Connection-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Handshake state may only move forward
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: HandshakeState,
        /// Requested state
        to: HandshakeState,
    },

    /// Operation on a closed connection
    #[error("connection closed")]
    Closed,

    /// Channel refused the operation
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Environment provider errors
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The environment cannot create a context right now
    #[error("context unavailable: {0}")]
    ContextUnavailable(String),

    /// Handle was never created or already destroyed
    #[error("unknown context: {0:?}")]
    UnknownContext(ContextHandle),

    /// Transport could not be bound
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Session manager errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Environment or transport setup failed; the client is left as before the call
    #[error("setup failed: {0}")]
    Setup(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No open connection to send on
    #[error("not connected")]
    NotConnected,

    /// Channel-level failure on send
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Connection refused the operation
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<EnvironmentError> for ClientError {
    fn from(err: EnvironmentError) -> Self {
        Self::Setup(err.to_string())
    }
}
