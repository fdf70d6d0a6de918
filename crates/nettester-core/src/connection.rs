//! Connection handshake state machine and per-peer session state.
//!
//! A Connection is one peer session over a shared transport. It owns the
//! channels multiplexed to that peer, queues outbound packets until the
//! next flush and buffers inbound datagrams until the next receive pump.
//!
//! Handshake, outbound side:
//!
//! ```text
//! Idle ──Hello──> VersionSent ──Welcome──> VersionAcked ──┬──────────────> Open
//!                                                         └─(token)─> SecurityHandshake ─> Open
//! ```
//!
//! The listener side runs the same states in one step when a valid Hello
//! arrives and answers with a Welcome echoing the Hello's token.

use crate::channel::{Channel, ChannelAcceptor, ChannelKind};
use crate::config::ConnectionConfig;
use crate::error::{ChannelError, ConnectionError};
use crate::events::{EventSink, FailureReason};
use crate::frame::{ByteOrder, DataFrame, Hello, Packet};
use crate::{CONTROL_CHANNEL, TEXT_CHANNEL};
use nettester_transport::Transport;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Connection identifier, unique within one client.
///
/// Allocated sequentially from 1; 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Reserved (invalid) connection ID
    pub const INVALID: Self = Self(0);

    /// Create a connection ID from a raw value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw `u64` value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is a valid connection ID
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the handshake a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepted by a listening client
    Listener,
    /// Opened by `connect`
    Outbound,
}

/// Handshake progress. Variant order is the order of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet
    Idle,
    /// Hello sent, awaiting Welcome
    VersionSent,
    /// Versions agreed
    VersionAcked,
    /// Security token exchange in progress
    SecurityHandshake,
    /// Handshake complete, channels open
    Open,
    /// Terminal state
    Closed,
}

/// Per-connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the transport
    pub packets_sent: u64,
    /// Datagrams received from the peer
    pub packets_received: u64,
    /// Bytes handed to the transport
    pub bytes_sent: u64,
    /// Bytes received from the peer
    pub bytes_received: u64,
    /// Flushes that wrote at least one datagram
    pub flushes: u64,
    /// Hello and Data retransmissions
    pub retransmits: u64,
    /// Malformed packets and undecodable payloads
    pub decode_errors: u64,
}

/// One peer session
pub struct Connection {
    id: ConnectionId,
    role: Role,
    remote: SocketAddr,
    state: HandshakeState,
    config: ConnectionConfig,
    timeout: Duration,
    last_activity: Duration,
    last_send: Duration,
    channels: BTreeMap<u16, Channel>,
    // Peer channel indices refused by the acceptor
    rejected: HashSet<u16>,
    control_queue: VecDeque<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    local_order: ByteOrder,
    peer_order: Option<ByteOrder>,
    peer_token: Vec<u8>,
    hello_sent_at: Duration,
    hello_attempts: u32,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection in `Idle` with the Control and Text channels registered.
    ///
    /// The effective timeout is the larger of the configured timeout and the
    /// transport's default.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        role: Role,
        remote: SocketAddr,
        config: ConnectionConfig,
        transport_timeout: Duration,
        now: Duration,
    ) -> Self {
        let window = config.reorder_window;
        let mut channels = BTreeMap::new();
        channels.insert(
            CONTROL_CHANNEL,
            Channel::new(CONTROL_CHANNEL, ChannelKind::Control, window),
        );
        channels.insert(
            TEXT_CHANNEL,
            Channel::new(TEXT_CHANNEL, ChannelKind::Text, window),
        );

        let timeout = config.timeout.max(transport_timeout);
        tracing::debug!(
            "Connection {} ({:?}) to {} created, timeout {:?}",
            id,
            role,
            remote,
            timeout
        );

        Self {
            id,
            role,
            remote,
            state: HandshakeState::Idle,
            config,
            timeout,
            last_activity: now,
            last_send: now,
            channels,
            rejected: HashSet::new(),
            control_queue: VecDeque::new(),
            inbound: VecDeque::new(),
            local_order: ByteOrder::native(),
            peer_order: None,
            peer_token: Vec::new(),
            hello_sent_at: now,
            hello_attempts: 0,
            stats: ConnectionStats::default(),
        }
    }

    /// Get the connection ID
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the connection role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the peer address
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Get the handshake state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the handshake completed and the connection is live
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == HandshakeState::Open
    }

    /// Whether the connection reached its terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    /// Effective timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Logical time of the last received packet or application send
    #[must_use]
    pub fn last_activity(&self) -> Duration {
        self.last_activity
    }

    /// Byte order this side writes handshake fields in
    #[must_use]
    pub fn local_byte_order(&self) -> ByteOrder {
        self.local_order
    }

    /// Byte order the peer announced, once its Hello or Welcome arrived
    #[must_use]
    pub fn peer_byte_order(&self) -> Option<ByteOrder> {
        self.peer_order
    }

    /// Get connection statistics
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Get a channel by index
    #[must_use]
    pub fn channel(&self, index: u16) -> Option<&Channel> {
        self.channels.get(&index)
    }

    /// Registered channel indices, ascending
    pub fn channel_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.channels.keys().copied()
    }

    /// Reliable frames awaiting acknowledgment plus packets awaiting a flush
    #[must_use]
    pub fn pending(&self) -> usize {
        self.control_queue.len()
            + self
                .channels
                .values()
                .map(|c| c.in_flight() + c.queued())
                .sum::<usize>()
    }

    /// Check if a state transition is valid. States only move forward.
    #[must_use]
    pub fn can_transition(&self, to: HandshakeState) -> bool {
        to > self.state
    }

    /// Transition to a new handshake state
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidTransition` for any move that is not
    /// strictly forward.
    pub fn transition_to(&mut self, to: HandshakeState) -> Result<(), ConnectionError> {
        if !self.can_transition(to) {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        let from = self.state;
        self.state = to;

        match to {
            HandshakeState::Open => {
                for channel in self.channels.values_mut() {
                    channel.open();
                }
            }
            HandshakeState::Closed => {
                for channel in self.channels.values_mut() {
                    channel.close();
                }
            }
            _ => {}
        }

        tracing::debug!("Connection {} state transition: {:?} -> {:?}", self.id, from, to);
        Ok(())
    }

    /// Forward-only transition used where the target is known to be ahead
    fn advance(&mut self, to: HandshakeState) {
        if let Err(err) = self.transition_to(to) {
            tracing::warn!("Connection {}: {}", self.id, err);
        }
    }

    /// Queue the initial Hello and move to `VersionSent`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidTransition` unless the connection is
    /// an idle outbound connection.
    pub fn send_initial_join(&mut self, now: Duration) -> Result<(), ConnectionError> {
        if self.role != Role::Outbound || self.state != HandshakeState::Idle {
            return Err(ConnectionError::InvalidTransition {
                from: self.state,
                to: HandshakeState::VersionSent,
            });
        }

        self.queue_hello();
        self.hello_sent_at = now;
        self.hello_attempts = 1;
        self.transition_to(HandshakeState::VersionSent)
    }

    fn queue_hello(&mut self) {
        let hello = Hello {
            byte_order: self.local_order,
            version: self.config.protocol_version,
            token: &self.config.security_token,
        };
        self.control_queue.push_back(Packet::Hello(hello).encode());
    }

    fn queue_welcome(&mut self) {
        let welcome = Hello {
            byte_order: self.local_order,
            version: self.config.protocol_version,
            token: &self.peer_token,
        };
        self.control_queue.push_back(Packet::Welcome(welcome).encode());
    }

    /// Buffer a datagram from the peer until the next receive pump
    pub fn enqueue_inbound(&mut self, data: Vec<u8>) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.inbound.push_back(data);
    }

    /// Decode and dispatch every buffered datagram in arrival order
    pub fn pump_receive(
        &mut self,
        now: Duration,
        events: &mut dyn EventSink,
        acceptor: &dyn ChannelAcceptor,
    ) {
        while let Some(datagram) = self.inbound.pop_front() {
            if self.is_closed() {
                tracing::trace!(
                    "Connection {} closed, discarding {} bytes",
                    self.id,
                    datagram.len()
                );
                continue;
            }

            match Packet::parse(&datagram) {
                Ok(packet) => {
                    self.last_activity = now;
                    tracing::trace!(
                        "Connection {} received {:?}",
                        self.id,
                        packet.packet_type()
                    );
                    self.handle_packet(packet, events, acceptor);
                }
                Err(err) => {
                    self.stats.decode_errors += 1;
                    tracing::warn!(
                        "Connection {}: malformed packet from {}: {}",
                        self.id,
                        self.remote,
                        err
                    );
                    events.on_decode_error(self.id, &err);
                }
            }
        }
    }

    fn handle_packet(
        &mut self,
        packet: Packet<'_>,
        events: &mut dyn EventSink,
        acceptor: &dyn ChannelAcceptor,
    ) {
        match packet {
            Packet::Hello(hello) => self.on_hello(hello, events),
            Packet::Welcome(welcome) => self.on_welcome(welcome, events),
            Packet::Reject(reason) => {
                if self.role == Role::Outbound {
                    tracing::warn!("Connection {} rejected by peer: {}", self.id, reason);
                    self.fail(FailureReason::HandshakeFailure(reason.to_string()), events);
                } else {
                    tracing::debug!("Connection {}: ignoring Reject from client", self.id);
                }
            }
            Packet::Data(frame) => self.on_data(&frame, events, acceptor),
            Packet::Ack { channel, sequence } => match self.channels.get_mut(&channel) {
                Some(ch) => {
                    ch.on_ack(sequence);
                }
                None => tracing::trace!("Connection {}: ack for unknown channel {}", self.id, channel),
            },
            Packet::Keepalive => {}
            Packet::Close => {
                tracing::info!("Connection {} closed by peer", self.id);
                self.advance(HandshakeState::Closed);
                events.on_disconnected(self.id);
            }
        }
    }

    fn on_hello(&mut self, hello: Hello<'_>, events: &mut dyn EventSink) {
        if self.role != Role::Listener {
            tracing::debug!("Connection {}: ignoring Hello on outbound connection", self.id);
            return;
        }

        self.peer_order = Some(hello.byte_order);

        match self.state {
            HandshakeState::Idle => {}
            HandshakeState::Open => {
                // Our Welcome was lost; the client is still retrying
                if hello.token == self.peer_token.as_slice() {
                    self.queue_welcome();
                }
                return;
            }
            _ => return,
        }

        if hello.version != self.config.protocol_version {
            let reason = format!(
                "version mismatch: expected 0x{:08X}, got 0x{:08X}",
                self.config.protocol_version, hello.version
            );
            self.reject(reason, events);
            return;
        }

        if let Some(expected) = &self.config.expected_token {
            if hello.token != expected.as_slice() {
                tracing::debug!(
                    "Connection {}: token {} does not match {}",
                    self.id,
                    hex::encode(hello.token),
                    hex::encode(expected)
                );
                self.reject("security token mismatch".to_string(), events);
                return;
            }
        }

        self.peer_token = hello.token.to_vec();
        self.advance(HandshakeState::VersionSent);
        self.advance(HandshakeState::VersionAcked);
        if !self.peer_token.is_empty() {
            self.advance(HandshakeState::SecurityHandshake);
        }
        self.queue_welcome();
        self.advance(HandshakeState::Open);

        tracing::info!("Connection {} accepted from {}", self.id, self.remote);
        events.on_connected(self.id);
    }

    fn on_welcome(&mut self, welcome: Hello<'_>, events: &mut dyn EventSink) {
        if self.role != Role::Outbound || self.state != HandshakeState::VersionSent {
            tracing::trace!("Connection {}: ignoring Welcome in {:?}", self.id, self.state);
            return;
        }

        self.peer_order = Some(welcome.byte_order);

        if welcome.version != self.config.protocol_version {
            let reason = format!(
                "version mismatch: expected 0x{:08X}, got 0x{:08X}",
                self.config.protocol_version, welcome.version
            );
            self.fail(FailureReason::HandshakeFailure(reason), events);
            return;
        }
        self.advance(HandshakeState::VersionAcked);

        if !self.config.security_token.is_empty() {
            self.advance(HandshakeState::SecurityHandshake);
            if welcome.token != self.config.security_token.as_slice() {
                tracing::debug!(
                    "Connection {}: Welcome echoed token {}",
                    self.id,
                    hex::encode(welcome.token)
                );
                self.fail(
                    FailureReason::HandshakeFailure("security token not echoed".to_string()),
                    events,
                );
                return;
            }
        }

        self.advance(HandshakeState::Open);
        tracing::info!("Connection {} to {} open", self.id, self.remote);
        events.on_connected(self.id);
    }

    fn on_data(
        &mut self,
        frame: &DataFrame<'_>,
        events: &mut dyn EventSink,
        acceptor: &dyn ChannelAcceptor,
    ) {
        if !self.is_open() {
            tracing::trace!(
                "Connection {}: dropping data in {:?}",
                self.id,
                self.state
            );
            return;
        }

        if self.rejected.contains(&frame.channel) {
            tracing::trace!(
                "Connection {}: discarding data for rejected channel {}",
                self.id,
                frame.channel
            );
            self.ack_discarded(frame);
            return;
        }

        if !self.channels.contains_key(&frame.channel) {
            let Some(kind) = frame.kind.map(ChannelKind::from_u8) else {
                tracing::debug!(
                    "Connection {}: data for unregistered channel {}",
                    self.id,
                    frame.channel
                );
                return;
            };

            if !acceptor.accept(kind) {
                tracing::warn!(
                    "Connection {}: rejected peer channel {} of kind {}",
                    self.id,
                    frame.channel,
                    kind
                );
                self.rejected.insert(frame.channel);
                self.ack_discarded(frame);
                return;
            }

            tracing::debug!(
                "Connection {}: peer opened channel {} ({})",
                self.id,
                frame.channel,
                kind
            );
            let mut channel = Channel::new(frame.channel, kind, self.config.reorder_window);
            channel.open();
            self.channels.insert(frame.channel, channel);
        }

        let Some(channel) = self.channels.get_mut(&frame.channel) else {
            return;
        };
        let messages = channel.on_data(frame);
        for message in messages {
            if channel.deliver(&message, self.id, events).is_some() {
                self.stats.decode_errors += 1;
            }
        }
    }

    // Acknowledge a reliable frame that will never be delivered so the
    // sender stops retransmitting it.
    fn ack_discarded(&mut self, frame: &DataFrame<'_>) {
        if let Some(sequence) = frame.sequence {
            self.control_queue.push_back(
                Packet::Ack {
                    channel: frame.channel,
                    sequence,
                }
                .encode(),
            );
        }
    }

    /// Register a channel, announced to the peer with its first frame
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::AlreadyRegistered` if the index is taken and
    /// `ChannelError::ChannelNotOpen` on a closed connection.
    pub fn open_channel(&mut self, index: u16, kind: ChannelKind) -> Result<(), ChannelError> {
        if self.channels.contains_key(&index) {
            return Err(ChannelError::AlreadyRegistered(index));
        }
        if self.is_closed() {
            return Err(ChannelError::ChannelNotOpen(index));
        }

        let mut channel = Channel::new(index, kind, self.config.reorder_window).announced();
        if self.is_open() {
            channel.open();
        }
        self.channels.insert(index, channel);
        tracing::debug!("Connection {}: opened channel {} ({})", self.id, index, kind);
        Ok(())
    }

    /// Queue a payload on a channel. Counts as activity.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::ChannelNotOpen` unless the connection is
    /// `Open`, `ChannelError::UnknownChannel` for an unregistered index, and
    /// whatever the channel itself rejects.
    pub fn send(
        &mut self,
        index: u16,
        payload: &[u8],
        reliable: bool,
        now: Duration,
    ) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen(index));
        }
        let channel = self
            .channels
            .get_mut(&index)
            .ok_or(ChannelError::UnknownChannel(index))?;
        let frames = channel.send(payload, reliable, now, &self.config)?;
        self.last_activity = now;
        Ok(frames)
    }

    /// Queue a text message on the Text channel
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub fn send_text(&mut self, text: &str, now: Duration) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelNotOpen(TEXT_CHANNEL));
        }
        let channel = self
            .channels
            .get_mut(&TEXT_CHANNEL)
            .ok_or(ChannelError::UnknownChannel(TEXT_CHANNEL))?;
        let frames = channel.send_text(text, now, &self.config)?;
        self.last_activity = now;
        Ok(frames)
    }

    /// Enforce the timeout, schedule retransmissions, acks and keepalives, then flush
    pub fn pump_send(
        &mut self,
        now: Duration,
        transport: &mut dyn Transport,
        events: &mut dyn EventSink,
    ) {
        if !self.is_closed() {
            self.schedule(now, events);
        }
        self.flush(now, transport, events);
    }

    fn schedule(&mut self, now: Duration, events: &mut dyn EventSink) {
        if now.saturating_sub(self.last_activity) > self.timeout {
            tracing::warn!(
                "Connection {} timed out after {:?} of silence",
                self.id,
                now.saturating_sub(self.last_activity)
            );
            if self.state > HandshakeState::Idle {
                self.control_queue.push_back(Packet::Close.encode());
            }
            self.fail(FailureReason::Timeout, events);
            return;
        }

        if self.state == HandshakeState::VersionSent {
            let deadline = self.hello_sent_at + self.config.retransmit.delay(self.hello_attempts);
            if now >= deadline {
                tracing::debug!(
                    "Connection {}: resending Hello (attempt {})",
                    self.id,
                    self.hello_attempts + 1
                );
                self.queue_hello();
                self.hello_sent_at = now;
                self.hello_attempts = self.hello_attempts.saturating_add(1);
                self.stats.retransmits += 1;
            }
        }

        if !self.is_open() {
            return;
        }

        for (&index, channel) in &mut self.channels {
            let resent = channel.retransmit_due(now, &self.config.retransmit);
            if resent > 0 {
                tracing::debug!(
                    "Connection {}: retransmitting {} frame(s) on channel {}",
                    self.id,
                    resent,
                    index
                );
                self.stats.retransmits += resent as u64;
            }
            if let Some(sequence) = channel.take_ack() {
                self.control_queue.push_back(
                    Packet::Ack {
                        channel: index,
                        sequence,
                    }
                    .encode(),
                );
            }
        }

        let idle = now.saturating_sub(self.last_send) >= self.config.keepalive_interval;
        let nothing_queued =
            self.control_queue.is_empty() && self.channels.values().all(|c| c.queued() == 0);
        if idle && nothing_queued {
            tracing::trace!("Connection {}: keepalive", self.id);
            self.control_queue.push_back(Packet::Keepalive.encode());
        }
    }

    /// Write the control queue, then each channel's queue in index order.
    ///
    /// When the transport reports a full send buffer, the unsent packets go
    /// back to the front of the control queue for the next flush.
    pub fn flush(&mut self, now: Duration, transport: &mut dyn Transport, events: &mut dyn EventSink) {
        let mut packets: VecDeque<Vec<u8>> = self.control_queue.drain(..).collect();
        for channel in self.channels.values_mut() {
            packets.extend(channel.drain_queue());
        }
        if packets.is_empty() {
            return;
        }

        let mut sent_any = false;
        while let Some(packet) = packets.pop_front() {
            match transport.send_to(&packet, self.remote) {
                Ok(sent) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += sent as u64;
                    sent_any = true;
                }
                Err(err) if err.is_would_block() => {
                    tracing::debug!(
                        "Connection {}: send buffer full, deferring {} packets",
                        self.id,
                        packets.len() + 1
                    );
                    packets.push_front(packet);
                    packets.append(&mut self.control_queue);
                    self.control_queue = packets;
                    break;
                }
                Err(err) => {
                    tracing::warn!("Connection {}: send to {} failed: {}", self.id, self.remote, err);
                    if !self.is_closed() {
                        self.fail(FailureReason::Transport(err.to_string()), events);
                    }
                    return;
                }
            }
        }

        if sent_any {
            self.stats.flushes += 1;
            self.last_send = now;
        }
    }

    /// Close the connection, queueing a best-effort Close for the peer.
    ///
    /// Fires `on_disconnected` once; closing again is a no-op.
    pub fn close(&mut self, events: &mut dyn EventSink) {
        if self.is_closed() {
            return;
        }
        if self.state > HandshakeState::Idle {
            self.control_queue.push_back(Packet::Close.encode());
        }
        self.advance(HandshakeState::Closed);
        tracing::info!("Connection {} to {} closed", self.id, self.remote);
        events.on_disconnected(self.id);
    }

    /// Close the connection and report the failure
    pub fn fail(&mut self, reason: FailureReason, events: &mut dyn EventSink) {
        if self.is_closed() {
            return;
        }
        self.advance(HandshakeState::Closed);
        tracing::warn!("Connection {} failed: {}", self.id, reason);
        events.on_connection_failed(self.id, &reason);
    }

    fn reject(&mut self, reason: String, events: &mut dyn EventSink) {
        tracing::warn!("Connection {}: rejecting {}: {}", self.id, self.remote, reason);
        self.control_queue.push_back(Packet::Reject(&reason).encode());
        self.fail(FailureReason::HandshakeFailure(reason), events);
    }

    /// Raise the timeout to at least `timeout` and count now as activity
    pub fn reset_timeout(&mut self, timeout: Duration, now: Duration) {
        if self.is_closed() {
            return;
        }
        self.timeout = self.timeout.max(timeout);
        self.last_activity = now;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DefaultChannelAcceptor;
    use crate::events::NetEvent;
    use crate::frame::encode_text;
    use nettester_transport::{MemoryNetwork, MemoryTransport};

    const CLIENT_ADDR: &str = "127.0.0.1:5000";
    const SERVER_ADDR: &str = "127.0.0.1:6000";

    struct Harness {
        network: MemoryNetwork,
        client_transport: MemoryTransport,
        server_transport: MemoryTransport,
        client: Connection,
        server: Connection,
        client_events: Vec<NetEvent>,
        server_events: Vec<NetEvent>,
        now: Duration,
    }

    impl Harness {
        fn new(client_config: ConnectionConfig, server_config: ConnectionConfig) -> Self {
            let network = MemoryNetwork::new();
            let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
            let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();
            Self {
                client_transport: network.bind(client_addr).unwrap(),
                server_transport: network.bind(server_addr).unwrap(),
                network,
                client: Connection::new(
                    ConnectionId::new(1),
                    Role::Outbound,
                    server_addr,
                    client_config,
                    Duration::ZERO,
                    Duration::ZERO,
                ),
                server: Connection::new(
                    ConnectionId::new(2),
                    Role::Listener,
                    client_addr,
                    server_config,
                    Duration::ZERO,
                    Duration::ZERO,
                ),
                client_events: Vec::new(),
                server_events: Vec::new(),
                now: Duration::ZERO,
            }
        }

        fn deliver(transport: &mut MemoryTransport, conn: &mut Connection) {
            while let Some(datagram) = transport.try_recv().unwrap() {
                conn.enqueue_inbound(datagram.data);
            }
        }

        fn tick(&mut self, delta: Duration) {
            self.now += delta;
            let acceptor = DefaultChannelAcceptor;

            Self::deliver(&mut self.client_transport, &mut self.client);
            self.client
                .pump_receive(self.now, &mut self.client_events, &acceptor);
            self.client
                .pump_send(self.now, &mut self.client_transport, &mut self.client_events);

            Self::deliver(&mut self.server_transport, &mut self.server);
            self.server
                .pump_receive(self.now, &mut self.server_events, &acceptor);
            self.server
                .pump_send(self.now, &mut self.server_transport, &mut self.server_events);
        }

        fn handshake(&mut self) {
            self.client.send_initial_join(self.now).unwrap();
            self.client
                .flush(self.now, &mut self.client_transport, &mut self.client_events);
            for _ in 0..3 {
                self.tick(Duration::from_millis(10));
            }
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_connection_id() {
        assert!(!ConnectionId::INVALID.is_valid());
        assert!(ConnectionId::new(1).is_valid());
        assert_eq!(ConnectionId::new(7).to_string(), "#7");
        assert_eq!(ConnectionId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_state_order() {
        assert!(HandshakeState::Idle < HandshakeState::VersionSent);
        assert!(HandshakeState::VersionAcked < HandshakeState::SecurityHandshake);
        assert!(HandshakeState::Open < HandshakeState::Closed);
    }

    #[test]
    fn test_transitions_forward_only() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        let conn = &mut harness.client;

        assert!(conn.transition_to(HandshakeState::VersionSent).is_ok());
        assert_eq!(
            conn.transition_to(HandshakeState::Idle),
            Err(ConnectionError::InvalidTransition {
                from: HandshakeState::VersionSent,
                to: HandshakeState::Idle
            })
        );
        assert!(conn.transition_to(HandshakeState::VersionSent).is_err());
        assert!(conn.transition_to(HandshakeState::Closed).is_ok());
        assert!(conn.transition_to(HandshakeState::Closed).is_err());
    }

    #[test]
    fn test_channels_preregistered() {
        let harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        let indices: Vec<u16> = harness.client.channel_indices().collect();
        assert_eq!(indices, vec![CONTROL_CHANNEL, TEXT_CHANNEL]);
        assert_eq!(
            harness.client.channel(TEXT_CHANNEL).unwrap().kind(),
            ChannelKind::Text
        );
        assert!(!harness.client.channel(TEXT_CHANNEL).unwrap().is_open());
    }

    #[test]
    fn test_effective_timeout() {
        let config = ConnectionConfig {
            timeout: Duration::from_secs(5),
            ..ConnectionConfig::default()
        };
        let addr: SocketAddr = SERVER_ADDR.parse().unwrap();
        let conn = Connection::new(
            ConnectionId::new(1),
            Role::Outbound,
            addr,
            config.clone(),
            Duration::from_secs(30),
            Duration::ZERO,
        );
        assert_eq!(conn.timeout(), Duration::from_secs(30));

        let conn = Connection::new(
            ConnectionId::new(1),
            Role::Outbound,
            addr,
            config,
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(conn.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_handshake_opens_both_sides() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();

        assert!(harness.client.is_open());
        assert!(harness.server.is_open());
        assert_eq!(harness.client_events, vec![NetEvent::Connected(ConnectionId::new(1))]);
        assert_eq!(harness.server_events, vec![NetEvent::Connected(ConnectionId::new(2))]);
        assert_eq!(harness.client.peer_byte_order(), Some(ByteOrder::native()));
    }

    #[test]
    fn test_security_token_echoed() {
        let client = ConnectionConfig {
            security_token: b"secret".to_vec(),
            ..ConnectionConfig::default()
        };
        let server = ConnectionConfig {
            expected_token: Some(b"secret".to_vec()),
            ..ConnectionConfig::default()
        };
        let mut harness = Harness::new(client, server);
        harness.handshake();

        assert!(harness.client.is_open());
        assert!(harness.server.is_open());
    }

    #[test]
    fn test_bad_token_rejected() {
        let client = ConnectionConfig {
            security_token: b"wrong".to_vec(),
            ..ConnectionConfig::default()
        };
        let server = ConnectionConfig {
            expected_token: Some(b"secret".to_vec()),
            ..ConnectionConfig::default()
        };
        let mut harness = Harness::new(client, server);
        harness.handshake();

        assert!(harness.client.is_closed());
        assert!(harness.server.is_closed());
        assert!(matches!(
            harness.client_events.as_slice(),
            [NetEvent::ConnectionFailed {
                reason: FailureReason::HandshakeFailure(_),
                ..
            }]
        ));
        assert!(matches!(
            harness.server_events.as_slice(),
            [NetEvent::ConnectionFailed {
                reason: FailureReason::HandshakeFailure(_),
                ..
            }]
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let client = ConnectionConfig {
            protocol_version: 99,
            ..ConnectionConfig::default()
        };
        let mut harness = Harness::new(client, ConnectionConfig::default());
        harness.handshake();

        assert!(harness.client.is_closed());
        assert!(harness.server.is_closed());
        match &harness.client_events[..] {
            [NetEvent::ConnectionFailed {
                reason: FailureReason::HandshakeFailure(reason),
                ..
            }] => assert!(reason.contains("version mismatch")),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_send_before_open_rejected() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.client.send_initial_join(Duration::ZERO).unwrap();
        assert_eq!(
            harness.client.send_text("early", Duration::ZERO),
            Err(ChannelError::ChannelNotOpen(TEXT_CHANNEL))
        );
    }

    #[test]
    fn test_text_exchange_and_ack() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.server_events.clear();

        let now = harness.now;
        harness.client.send_text("F1", now).unwrap();
        harness.client.send_text("F2", now).unwrap();
        harness
            .client
            .flush(now, &mut harness.client_transport, &mut harness.client_events);
        assert_eq!(harness.client.channel(TEXT_CHANNEL).unwrap().in_flight(), 2);

        harness.tick(ms(10));
        harness.tick(ms(10));

        let id = ConnectionId::new(2);
        assert_eq!(
            harness.server_events,
            vec![
                NetEvent::TextReceived {
                    connection: id,
                    text: "F1".to_string()
                },
                NetEvent::TextReceived {
                    connection: id,
                    text: "F2".to_string()
                },
            ]
        );
        assert_eq!(harness.client.channel(TEXT_CHANNEL).unwrap().in_flight(), 0);
    }

    #[test]
    fn test_hello_retransmitted_until_answered() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.network.set_drop_filter(|_, _, bytes| bytes.first() == Some(&0x01));
        harness.client.send_initial_join(Duration::ZERO).unwrap();
        harness
            .client
            .flush(Duration::ZERO, &mut harness.client_transport, &mut harness.client_events);

        harness.tick(ms(200));
        assert_eq!(harness.client.stats().retransmits, 1);
        assert!(!harness.client.is_open());

        harness.network.clear_drop_filter();
        harness.tick(ms(300));
        harness.tick(ms(10));
        harness.tick(ms(10));
        assert!(harness.client.is_open());
    }

    #[test]
    fn test_timeout_fires_once() {
        let config = ConnectionConfig {
            timeout: Duration::from_secs(1),
            ..ConnectionConfig::default()
        };
        let addr: SocketAddr = SERVER_ADDR.parse().unwrap();
        let network = MemoryNetwork::new();
        let mut transport = network.bind(CLIENT_ADDR.parse().unwrap()).unwrap();
        let mut conn = Connection::new(
            ConnectionId::new(1),
            Role::Outbound,
            addr,
            config,
            Duration::ZERO,
            Duration::ZERO,
        );
        let mut events: Vec<NetEvent> = Vec::new();
        conn.send_initial_join(Duration::ZERO).unwrap();

        conn.pump_send(Duration::from_secs(1), &mut transport, &mut events);
        assert!(!conn.is_closed());

        conn.pump_send(Duration::from_secs(2), &mut transport, &mut events);
        conn.pump_send(Duration::from_secs(3), &mut transport, &mut events);
        assert!(conn.is_closed());
        assert_eq!(
            events,
            vec![NetEvent::ConnectionFailed {
                connection: ConnectionId::new(1),
                reason: FailureReason::Timeout
            }]
        );
    }

    #[test]
    fn test_keepalive_holds_connection_open() {
        let config = ConnectionConfig {
            timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        };
        let mut harness = Harness::new(config.clone(), config);
        harness.handshake();

        for _ in 0..50 {
            harness.tick(ms(100));
        }
        assert!(harness.client.is_open());
        assert!(harness.server.is_open());
    }

    #[test]
    fn test_malformed_packet_keeps_connection_open() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.server_events.clear();

        // Data frame declaring 10 payload bytes but carrying 2
        harness.server.enqueue_inbound(vec![0x04, 1, 0, 10, b'h', b'i']);
        harness.tick(ms(10));

        assert!(harness.server.is_open());
        assert_eq!(harness.server.stats().decode_errors, 1);
        assert!(matches!(
            harness.server_events.as_slice(),
            [NetEvent::DecodeError {
                error: crate::error::FrameError::LengthOverflow { .. },
                ..
            }]
        ));
    }

    #[test]
    fn test_invalid_utf8_text_is_decode_error() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.server_events.clear();

        let mut payload = encode_text("ok");
        payload[1] = 0xFF;
        let packet = Packet::Data(DataFrame {
            channel: TEXT_CHANNEL,
            kind: None,
            sequence: None,
            more: false,
            payload: &payload,
        })
        .encode();
        harness.server.enqueue_inbound(packet);
        harness.tick(ms(10));

        assert!(harness.server.is_open());
        assert!(matches!(
            harness.server_events.as_slice(),
            [NetEvent::DecodeError {
                error: crate::error::FrameError::InvalidUtf8,
                ..
            }]
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_notifies_peer() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.client_events.clear();
        harness.server_events.clear();

        harness.client.close(&mut harness.client_events);
        harness.client.close(&mut harness.client_events);
        assert_eq!(
            harness.client_events,
            vec![NetEvent::Disconnected(ConnectionId::new(1))]
        );

        harness.tick(ms(10));
        assert!(harness.server.is_closed());
        assert_eq!(
            harness.server_events,
            vec![NetEvent::Disconnected(ConnectionId::new(2))]
        );
    }

    #[test]
    fn test_peer_channel_policy() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();

        harness.client.open_channel(7, ChannelKind::Unknown(42)).unwrap();
        assert_eq!(
            harness.client.open_channel(7, ChannelKind::Control),
            Err(ChannelError::AlreadyRegistered(7))
        );
        harness.client.send(7, b"x", true, harness.now).unwrap();
        harness.client.open_channel(8, ChannelKind::Control).unwrap();
        harness.client.send(8, b"ctl", true, harness.now).unwrap();
        harness.tick(ms(10));
        harness.tick(ms(10));

        assert!(harness.server.channel(7).is_none());
        assert_eq!(
            harness.server.channel(8).map(Channel::kind),
            Some(ChannelKind::Control)
        );
        // The rejected frame was acknowledged, not retransmitted forever
        assert_eq!(harness.client.channel(7).unwrap().in_flight(), 0);
        assert!(harness.server_events.contains(&NetEvent::ControlReceived {
            connection: ConnectionId::new(2),
            payload: b"ctl".to_vec()
        }));
    }

    #[test]
    fn test_rejected_channel_later_frames_acked() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.server_events.clear();

        harness.client.open_channel(7, ChannelKind::Unknown(42)).unwrap();
        for payload in [&b"first"[..], b"second", b"third"] {
            harness.client.send(7, payload, true, harness.now).unwrap();
        }
        harness.tick(ms(10));
        harness.tick(ms(10));
        harness.client.send(7, b"fourth", true, harness.now).unwrap();
        harness.tick(ms(10));
        harness.tick(ms(10));

        assert!(harness.server.channel(7).is_none());
        assert_eq!(harness.client.channel(7).unwrap().in_flight(), 0);
        assert!(harness.server_events.is_empty());
    }

    #[test]
    fn test_full_send_buffer_defers_packets() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.handshake();
        harness.client_events.clear();
        harness.server_events.clear();

        for text in ["a", "b", "c"] {
            harness.client.send_text(text, harness.now).unwrap();
        }
        harness.network.set_send_budget(Some(1));
        harness
            .client
            .flush(harness.now, &mut harness.client_transport, &mut harness.client_events);

        assert!(harness.client.is_open());
        assert!(harness.client_events.is_empty());
        assert_eq!(harness.network.pending(SERVER_ADDR.parse().unwrap()), 1);

        harness.network.set_send_budget(None);
        harness.tick(ms(10));
        harness.tick(ms(10));

        let texts: Vec<_> = harness
            .server_events
            .iter()
            .filter_map(|event| match event {
                NetEvent::TextReceived { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(harness.client.is_open());
    }

    #[test]
    fn test_reset_timeout_only_raises() {
        let mut harness = Harness::new(ConnectionConfig::default(), ConnectionConfig::default());
        harness.client.reset_timeout(Duration::from_secs(1), ms(50));
        assert_eq!(harness.client.timeout(), Duration::from_secs(5));
        assert_eq!(harness.client.last_activity(), ms(50));

        harness.client.reset_timeout(Duration::from_secs(60), ms(60));
        assert_eq!(harness.client.timeout(), Duration::from_secs(60));
    }
}
