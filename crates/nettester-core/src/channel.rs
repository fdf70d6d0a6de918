//! Logical channels multiplexed over a connection.
//!
//! Each channel is an independently ordered stream identified by a u16
//! index. Reliable payloads larger than one frame are split into fragments
//! flagged `MORE` and reassembled on receipt. What happens to a complete
//! message depends on the channel kind.

use crate::config::{ConnectionConfig, RetransmitPolicy};
use crate::connection::ConnectionId;
use crate::error::{ChannelError, FrameError};
use crate::events::EventSink;
use crate::frame::{decode_text, encode_text, DataFrame, Packet};
use crate::reliable::{ReliableReceiver, ReliableSender};
use crate::MAX_PAYLOAD_LEN;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// What a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Raw control messages
    Control,
    /// Length-prefixed UTF-8 strings
    Text,
    /// A kind this client does not understand
    Unknown(u8),
}

impl ChannelKind {
    /// Wire value of the kind
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Text => 1,
            Self::Unknown(kind) => kind,
        }
    }

    /// Kind for a wire value
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Control,
            1 => Self::Text,
            other => Self::Unknown(other),
        }
    }

    /// Whether this client knows how to handle the kind
    #[must_use]
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Text => write!(f, "text"),
            Self::Unknown(kind) => write!(f, "unknown({kind})"),
        }
    }
}

/// Policy deciding whether a peer may open a channel of a given kind
pub trait ChannelAcceptor: Send {
    /// Return true to register the channel
    fn accept(&self, kind: ChannelKind) -> bool;
}

impl<F> ChannelAcceptor for F
where
    F: Fn(ChannelKind) -> bool + Send,
{
    fn accept(&self, kind: ChannelKind) -> bool {
        self(kind)
    }
}

/// Accepts Control and Text channels, rejects everything else
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChannelAcceptor;

impl ChannelAcceptor for DefaultChannelAcceptor {
    fn accept(&self, kind: ChannelKind) -> bool {
        kind.is_known()
    }
}

/// A Data frame kept for (re)transmission
#[derive(Debug, Clone)]
pub(crate) struct OutboundFrame {
    sequence: Option<u32>,
    kind: Option<u8>,
    more: bool,
    payload: Vec<u8>,
}

impl OutboundFrame {
    fn encode(&self, channel: u16) -> Vec<u8> {
        Packet::Data(DataFrame {
            channel,
            kind: self.kind,
            sequence: self.sequence,
            more: self.more,
            payload: &self.payload,
        })
        .encode()
    }
}

/// One received fragment waiting for in-order delivery
#[derive(Debug)]
struct Fragment {
    more: bool,
    payload: Vec<u8>,
}

/// A logical channel within a connection
#[derive(Debug)]
pub struct Channel {
    index: u16,
    kind: ChannelKind,
    open: bool,
    announce: bool,
    sender: ReliableSender<OutboundFrame>,
    receiver: ReliableReceiver<Fragment>,
    send_queue: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    // Dropping fragments of an oversized message until its last one
    discarding: bool,
    ack_pending: bool,
}

impl Channel {
    /// Create a closed channel with a reorder window of `window` frames
    #[must_use]
    pub fn new(index: u16, kind: ChannelKind, window: u32) -> Self {
        Self {
            index,
            kind,
            open: false,
            announce: false,
            sender: ReliableSender::new(),
            receiver: ReliableReceiver::new(window),
            send_queue: VecDeque::new(),
            partial: Vec::new(),
            discarding: false,
            ack_pending: false,
        }
    }

    /// Announce the channel to the peer with the first frame sent on it
    #[must_use]
    pub fn announced(mut self) -> Self {
        self.announce = true;
        self
    }

    /// Get the channel index
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Get the channel kind
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether sends are allowed
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Reliable frames awaiting acknowledgment
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.sender.in_flight()
    }

    /// Encoded packets waiting for the next flush
    #[must_use]
    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }

    /// Duplicate reliable frames received
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.receiver.duplicates()
    }

    pub(crate) fn open(&mut self) {
        self.open = true;
    }

    /// Close the channel, discarding queued and unacknowledged frames
    pub fn close(&mut self) {
        self.open = false;
        self.sender.clear();
        self.send_queue.clear();
        self.partial.clear();
        self.discarding = false;
        self.ack_pending = false;
    }

    /// Frame a payload and queue it for the next flush.
    ///
    /// Returns the number of frames queued.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::ChannelNotOpen` before the handshake completes
    /// and `ChannelError::PayloadTooLarge` for an unreliable payload that
    /// does not fit one frame or any payload over `MAX_PAYLOAD_LEN`.
    pub fn send(
        &mut self,
        payload: &[u8],
        reliable: bool,
        now: Duration,
        config: &ConnectionConfig,
    ) -> Result<usize, ChannelError> {
        if !self.open {
            return Err(ChannelError::ChannelNotOpen(self.index));
        }

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }

        let limit = config.max_frame_payload;
        if payload.len() > limit && !reliable {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let mut chunks: Vec<&[u8]> = payload.chunks(limit).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let sequence = reliable.then(|| self.sender.next_sequence());
            let kind = std::mem::take(&mut self.announce).then(|| self.kind.as_u8());
            let frame = OutboundFrame {
                sequence,
                kind,
                more: i + 1 < count,
                payload: chunk.to_vec(),
            };

            self.send_queue.push_back(frame.encode(self.index));
            if let Some(seq) = sequence {
                self.sender.track(seq, frame, now);
            }
        }

        tracing::trace!(
            "Channel {} queued {} bytes in {} frame(s)",
            self.index,
            payload.len(),
            count
        );
        Ok(count)
    }

    /// Queue a text message on this channel
    ///
    /// # Errors
    ///
    /// See [`Channel::send`].
    pub fn send_text(
        &mut self,
        text: &str,
        now: Duration,
        config: &ConnectionConfig,
    ) -> Result<usize, ChannelError> {
        self.send(&encode_text(text), true, now, config)
    }

    /// Accept an incoming Data frame, returning completed messages in order
    pub(crate) fn on_data(&mut self, frame: &DataFrame<'_>) -> Vec<Vec<u8>> {
        let fragment = Fragment {
            more: frame.more,
            payload: frame.payload.to_vec(),
        };

        let fragments = match frame.sequence {
            Some(seq) => {
                self.ack_pending = true;
                self.receiver.receive(seq, fragment)
            }
            None => vec![fragment],
        };

        let mut messages = Vec::new();
        for fragment in fragments {
            if self.discarding {
                self.discarding = fragment.more;
                continue;
            }
            if self.partial.len() + fragment.payload.len() > MAX_PAYLOAD_LEN {
                tracing::warn!(
                    "Channel {} message exceeds {} bytes, discarding",
                    self.index,
                    MAX_PAYLOAD_LEN
                );
                self.partial.clear();
                self.discarding = fragment.more;
                continue;
            }
            self.partial.extend_from_slice(&fragment.payload);
            if !fragment.more {
                messages.push(std::mem::take(&mut self.partial));
            }
        }
        messages
    }

    /// Hand a complete message to the event sink according to the channel kind.
    ///
    /// Returns the decode error for Text payloads that are not valid strings.
    pub(crate) fn deliver(
        &self,
        message: &[u8],
        connection: ConnectionId,
        events: &mut dyn EventSink,
    ) -> Option<FrameError> {
        match self.kind {
            ChannelKind::Text => match decode_text(message) {
                Ok(text) => {
                    events.on_text_received(text, connection);
                    None
                }
                Err(err) => {
                    tracing::warn!(
                        "Connection {} channel {}: undecodable text: {}",
                        connection,
                        self.index,
                        err
                    );
                    events.on_decode_error(connection, &err);
                    Some(err)
                }
            },
            ChannelKind::Control => {
                events.on_control_received(connection, message);
                None
            }
            ChannelKind::Unknown(kind) => {
                tracing::debug!(
                    "Connection {} channel {}: ignoring {} bytes of kind {}",
                    connection,
                    self.index,
                    message.len(),
                    kind
                );
                None
            }
        }
    }

    /// Apply a cumulative ack from the peer
    pub(crate) fn on_ack(&mut self, highest: u32) -> usize {
        self.sender.on_ack(highest)
    }

    /// Ack owed to the peer since the last call, if any
    pub(crate) fn take_ack(&mut self) -> Option<u32> {
        std::mem::take(&mut self.ack_pending).then(|| self.receiver.highest_contiguous())
    }

    /// Queue every frame whose retransmit deadline has passed
    pub(crate) fn retransmit_due(&mut self, now: Duration, policy: &RetransmitPolicy) -> usize {
        let due = self.sender.due(now, policy);
        for (_, frame) in &due {
            self.send_queue.push_back(frame.encode(self.index));
        }
        due.len()
    }

    pub(crate) fn drain_queue(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.send_queue)
    }
}
