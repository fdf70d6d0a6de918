//! # NetTester Core
//!
//! Core protocol implementation for the NetTester minimal network client: a
//! stripped-down client/listener that performs a version handshake, then
//! exchanges reliable framed text messages over multiplexed channels.
//!
//! This crate provides:
//! - Packet encoding and decoding (zero-copy parsing)
//! - Per-channel reliable sequencing with retransmission
//! - Connection handshake state machine and timeout tracking
//! - The tick-driven [`MinimalClient`] session manager
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       MinimalClient                              │
//! │   (listen/connect/cleanup, fixed-rate tick, event sinks)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         NetDriver                                │
//! │   (one transport, accepted peers or one outbound connection)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Connections                               │
//! │   (handshake, timeout, control + text channels)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Packets                                 │
//! │   (Hello / Welcome / Data / Ack / Keepalive / Close)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate blocks or spawns threads. Every operation returns
//! immediately and leaves partial progress queued for the next tick.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod events;
pub mod frame;
pub mod reliable;
pub mod varint;

pub use channel::{Channel, ChannelAcceptor, ChannelKind, DefaultChannelAcceptor};
pub use client::{ConnectionInfo, MinimalClient};
pub use config::{ClientConfig, ConnectionConfig, RetransmitPolicy};
pub use connection::{Connection, ConnectionId, ConnectionStats, HandshakeState, Role};
pub use driver::NetDriver;
pub use endpoint::Endpoint;
pub use environment::{ContextHandle, Environment, MemoryEnvironment, UdpEnvironment};
pub use error::{ChannelError, ClientError, ConnectionError, EnvironmentError, Error, FrameError};
pub use events::{EventBus, EventSink, FailureReason, NetEvent, SubscriptionId};
pub use frame::{ByteOrder, DataFrame, FrameFlags, Hello, Packet, PacketType};
pub use reliable::{ReliableReceiver, ReliableSender};

/// Protocol version exchanged in the Hello handshake (major.minor encoded as u32)
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Channel index of the pre-registered control channel
pub const CONTROL_CHANNEL: u16 = 0;

/// Channel index of the pre-registered text channel
pub const TEXT_CHANNEL: u16 = 1;

/// Largest length any length-prefixed field may declare
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Default largest payload carried by a single Data frame before fragmenting
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 1024;

/// Worst-case Data frame overhead: type, 3-byte channel varint, flags, kind,
/// 5-byte sequence varint and a 3-byte length varint
pub const MAX_DATA_HEADER_LEN: usize = 14;

/// Largest `max_frame_payload` whose frames still fit in one UDP datagram
pub const MAX_FRAME_PAYLOAD: usize = nettester_transport::MAX_UDP_PAYLOAD - MAX_DATA_HEADER_LEN;

/// Largest security token a Hello can carry in one UDP datagram
pub const MAX_TOKEN_LEN: usize = nettester_transport::MAX_UDP_PAYLOAD - 10;
