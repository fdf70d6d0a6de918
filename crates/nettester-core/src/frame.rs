//! Packet encoding and decoding for the NetTester wire protocol.
//!
//! One packet travels per datagram and the first byte is the packet type.
//! Parsing is zero-copy: tokens, reasons and payloads borrow from the
//! datagram buffer. Handshake packets carry their fixed-width fields in the
//! sender's byte order, announced by a flag byte. Every other packet uses
//! varints, which have no byte order.

use crate::error::FrameError;
use crate::varint::{read_varint, varint_size, write_varint};
use crate::MAX_PAYLOAD_LEN;

/// Packet types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client handshake opener
    Hello = 0x01,
    /// Listener handshake acknowledgment
    Welcome = 0x02,
    /// Handshake refusal with a reason
    Reject = 0x03,
    /// Channel payload
    Data = 0x04,
    /// Cumulative channel acknowledgment
    Ack = 0x05,
    /// Liveness probe (no payload)
    Keepalive = 0x06,
    /// Connection termination
    Close = 0x07,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x03 => Ok(Self::Reject),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Ack),
            0x06 => Ok(Self::Keepalive),
            0x07 => Ok(Self::Close),
            _ => Err(FrameError::InvalidPacketType(value)),
        }
    }
}

/// Byte order of fixed-width handshake fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte first (flag 1)
    Little,
    /// Most significant byte first (flag 0)
    Big,
}

impl ByteOrder {
    /// Byte order of the machine we are running on
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    /// Wire flag for this byte order
    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Little => 1,
            Self::Big => 0,
        }
    }

    /// Parse a wire flag
    ///
    /// # Errors
    ///
    /// Returns `FrameError::InvalidByteOrder` for anything other than 0 or 1.
    pub const fn from_flag(flag: u8) -> Result<Self, FrameError> {
        match flag {
            1 => Ok(Self::Little),
            0 => Ok(Self::Big),
            other => Err(FrameError::InvalidByteOrder(other)),
        }
    }

    fn write_u32(self, buf: &mut Vec<u8>, value: u32) {
        match self {
            Self::Little => buf.extend_from_slice(&value.to_le_bytes()),
            Self::Big => buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// Data frame flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Frame carries a sequence number and must be acknowledged
    pub const RELIABLE: u8 = 0b0000_0001;
    /// Frame announces a new channel and carries its kind
    pub const OPEN: u8 = 0b0000_0010;
    /// Another fragment of the same message follows
    pub const MORE: u8 = 0b0000_0100;

    const KNOWN: u8 = Self::RELIABLE | Self::OPEN | Self::MORE;

    /// Create new empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Parse a flags byte, rejecting reserved bits
    ///
    /// # Errors
    ///
    /// Returns `FrameError::InvalidFlags` if any reserved bit is set.
    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        if bits & !Self::KNOWN != 0 {
            return Err(FrameError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }

    /// Add RELIABLE flag
    #[must_use]
    pub fn with_reliable(mut self) -> Self {
        self.0 |= Self::RELIABLE;
        self
    }

    /// Add OPEN flag
    #[must_use]
    pub fn with_open(mut self) -> Self {
        self.0 |= Self::OPEN;
        self
    }

    /// Add MORE flag
    #[must_use]
    pub fn with_more(mut self) -> Self {
        self.0 |= Self::MORE;
        self
    }

    /// Check if RELIABLE is set
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.0 & Self::RELIABLE != 0
    }

    /// Check if OPEN is set
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0 & Self::OPEN != 0
    }

    /// Check if MORE is set
    #[must_use]
    pub fn is_more(&self) -> bool {
        self.0 & Self::MORE != 0
    }

    /// Get raw byte value
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Body of a Hello or Welcome packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello<'a> {
    /// Byte order the sender wrote the fixed-width fields in
    pub byte_order: ByteOrder,
    /// Sender's protocol version
    pub version: u32,
    /// Security token (empty when unused)
    pub token: &'a [u8],
}

impl<'a> Hello<'a> {
    /// Hello in this machine's byte order
    #[must_use]
    pub fn native(version: u32, token: &'a [u8]) -> Self {
        Self {
            byte_order: ByteOrder::native(),
            version,
            token,
        }
    }
}

/// Body of a Data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    /// Channel index
    pub channel: u16,
    /// Channel kind, present when the frame announces the channel
    pub kind: Option<u8>,
    /// Sequence number, present on reliable frames
    pub sequence: Option<u32>,
    /// Another fragment of the same message follows
    pub more: bool,
    /// Frame payload
    pub payload: &'a [u8],
}

impl DataFrame<'_> {
    /// Flags implied by the optional fields
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::new();
        if self.sequence.is_some() {
            flags = flags.with_reliable();
        }
        if self.kind.is_some() {
            flags = flags.with_open();
        }
        if self.more {
            flags = flags.with_more();
        }
        flags
    }
}

/// A decoded packet borrowing from its datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Client handshake opener
    Hello(Hello<'a>),
    /// Listener handshake acknowledgment
    Welcome(Hello<'a>),
    /// Handshake refusal
    Reject(&'a str),
    /// Channel payload
    Data(DataFrame<'a>),
    /// Cumulative acknowledgment of a channel's reliable frames
    Ack {
        /// Channel index
        channel: u16,
        /// Highest contiguous sequence received
        sequence: u32,
    },
    /// Liveness probe
    Keepalive,
    /// Connection termination
    Close,
}

impl<'a> Packet<'a> {
    /// Parse a packet from a whole datagram (zero-copy)
    ///
    /// # Errors
    ///
    /// Returns `FrameError` if the datagram is truncated, declares lengths
    /// past its end, uses reserved values or carries trailing bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(data);
        let packet_type = PacketType::try_from(reader.u8()?)?;

        let packet = match packet_type {
            PacketType::Hello => Self::Hello(reader.hello()?),
            PacketType::Welcome => Self::Welcome(reader.hello()?),
            PacketType::Reject => {
                let reason = reader.length_prefixed()?;
                Self::Reject(std::str::from_utf8(reason).map_err(|_| FrameError::InvalidUtf8)?)
            }
            PacketType::Data => {
                let channel = reader.varint_u16("channel")?;
                let flags = FrameFlags::from_bits(reader.u8()?)?;
                let kind = if flags.is_open() {
                    Some(reader.u8()?)
                } else {
                    None
                };
                let sequence = if flags.is_reliable() {
                    Some(reader.varint_u32("sequence")?)
                } else {
                    None
                };
                let payload = reader.length_prefixed()?;
                Self::Data(DataFrame {
                    channel,
                    kind,
                    sequence,
                    more: flags.is_more(),
                    payload,
                })
            }
            PacketType::Ack => Self::Ack {
                channel: reader.varint_u16("channel")?,
                sequence: reader.varint_u32("sequence")?,
            },
            PacketType::Keepalive => Self::Keepalive,
            PacketType::Close => Self::Close,
        };

        reader.finish()?;
        Ok(packet)
    }

    /// Get the packet type
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Hello(_) => PacketType::Hello,
            Self::Welcome(_) => PacketType::Welcome,
            Self::Reject(_) => PacketType::Reject,
            Self::Data(_) => PacketType::Data,
            Self::Ack { .. } => PacketType::Ack,
            Self::Keepalive => PacketType::Keepalive,
            Self::Close => PacketType::Close,
        }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Hello(hello) | Self::Welcome(hello) => 9 + hello.token.len(),
            Self::Reject(reason) => varint_size(reason.len() as u64) + reason.len(),
            Self::Data(frame) => {
                varint_size(u64::from(frame.channel))
                    + 1
                    + usize::from(frame.kind.is_some())
                    + frame.sequence.map_or(0, |seq| varint_size(u64::from(seq)))
                    + varint_size(frame.payload.len() as u64)
                    + frame.payload.len()
            }
            Self::Ack { channel, sequence } => {
                varint_size(u64::from(*channel)) + varint_size(u64::from(*sequence))
            }
            Self::Keepalive | Self::Close => 0,
        }
    }

    /// Append the encoded packet to a buffer
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.push(self.packet_type() as u8);

        match self {
            Self::Hello(hello) | Self::Welcome(hello) => {
                buf.push(hello.byte_order.flag());
                hello.byte_order.write_u32(buf, hello.version);
                hello.byte_order.write_u32(buf, hello.token.len() as u32);
                buf.extend_from_slice(hello.token);
            }
            Self::Reject(reason) => {
                write_varint(buf, reason.len() as u64);
                buf.extend_from_slice(reason.as_bytes());
            }
            Self::Data(frame) => {
                write_varint(buf, u64::from(frame.channel));
                buf.push(frame.flags().as_u8());
                if let Some(kind) = frame.kind {
                    buf.push(kind);
                }
                if let Some(seq) = frame.sequence {
                    write_varint(buf, u64::from(seq));
                }
                write_varint(buf, frame.payload.len() as u64);
                buf.extend_from_slice(frame.payload);
            }
            Self::Ack { channel, sequence } => {
                write_varint(buf, u64::from(*channel));
                write_varint(buf, u64::from(*sequence));
            }
            Self::Keepalive | Self::Close => {}
        }
    }

    /// Encode the packet into a new buffer
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }
}

/// Encode a text message as a length-prefixed UTF-8 payload
#[must_use]
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(varint_size(text.len() as u64) + text.len());
    write_varint(&mut buf, text.len() as u64);
    buf.extend_from_slice(text.as_bytes());
    buf
}

/// Decode a length-prefixed UTF-8 payload
///
/// # Errors
///
/// Returns a malformed-frame error if the prefix is broken or bytes follow
/// the string, and `FrameError::InvalidUtf8` if the bytes are not UTF-8.
pub fn decode_text(payload: &[u8]) -> Result<&str, FrameError> {
    let mut reader = Reader::new(payload);
    let bytes = reader.length_prefixed()?;
    reader.finish()?;
    std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)
}

/// Bounds-checked cursor over a datagram
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::TooShort {
                expected: self.pos + len,
                actual: self.data.len(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self, order: ByteOrder) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(order.read_u32([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn varint(&mut self) -> Result<u64, FrameError> {
        let (value, consumed) = read_varint(&self.data[self.pos..]).map_err(|e| match e {
            FrameError::TooShort { .. } => FrameError::TooShort {
                expected: self.data.len() + 1,
                actual: self.data.len(),
            },
            other => other,
        })?;
        self.pos += consumed;
        Ok(value)
    }

    fn varint_u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        let value = self.varint()?;
        u16::try_from(value).map_err(|_| FrameError::FieldOutOfRange { field, value })
    }

    fn varint_u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        let value = self.varint()?;
        u32::try_from(value).map_err(|_| FrameError::FieldOutOfRange { field, value })
    }

    fn bounded(&mut self, declared: u64) -> Result<&'a [u8], FrameError> {
        if declared > MAX_PAYLOAD_LEN as u64 {
            return Err(FrameError::PayloadTooLarge(declared));
        }
        if declared > self.remaining() as u64 {
            return Err(FrameError::LengthOverflow {
                declared,
                remaining: self.remaining(),
            });
        }
        self.take(declared as usize)
    }

    fn length_prefixed(&mut self) -> Result<&'a [u8], FrameError> {
        let declared = self.varint()?;
        self.bounded(declared)
    }

    fn hello(&mut self) -> Result<Hello<'a>, FrameError> {
        let byte_order = ByteOrder::from_flag(self.u8()?)?;
        let version = self.u32(byte_order)?;
        let token_len = self.u32(byte_order)?;
        let token = self.bounded(u64::from(token_len))?;
        Ok(Hello {
            byte_order,
            version,
            token,
        })
    }

    fn finish(&self) -> Result<(), FrameError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(FrameError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(channel: u16, sequence: Option<u32>, payload: &[u8]) -> DataFrame<'_> {
        DataFrame {
            channel,
            kind: None,
            sequence,
            more: false,
            payload,
        }
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x01).unwrap(), PacketType::Hello);
        assert_eq!(PacketType::try_from(0x07).unwrap(), PacketType::Close);
        assert_eq!(
            PacketType::try_from(0x00),
            Err(FrameError::InvalidPacketType(0x00))
        );
        assert_eq!(
            PacketType::try_from(0x42),
            Err(FrameError::InvalidPacketType(0x42))
        );
    }

    #[test]
    fn test_hello_layout_little_endian() {
        let hello = Hello {
            byte_order: ByteOrder::Little,
            version: 0x0102_0304,
            token: b"ab",
        };
        let encoded = Packet::Hello(hello).encode();
        assert_eq!(
            encoded,
            vec![0x01, 1, 0x04, 0x03, 0x02, 0x01, 2, 0, 0, 0, b'a', b'b']
        );
        assert_eq!(Packet::parse(&encoded).unwrap(), Packet::Hello(hello));
    }

    #[test]
    fn test_hello_layout_big_endian() {
        let hello = Hello {
            byte_order: ByteOrder::Big,
            version: 0x0102_0304,
            token: b"",
        };
        let encoded = Packet::Welcome(hello).encode();
        assert_eq!(encoded, vec![0x02, 0, 0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0]);

        // The flag decides how the peer reads the version
        match Packet::parse(&encoded).unwrap() {
            Packet::Welcome(parsed) => {
                assert_eq!(parsed.byte_order, ByteOrder::Big);
                assert_eq!(parsed.version, 0x0102_0304);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_hello_invalid_byte_order() {
        let encoded = [0x01, 7, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Packet::parse(&encoded),
            Err(FrameError::InvalidByteOrder(7))
        );
    }

    #[test]
    fn test_hello_token_overflow() {
        let mut encoded = Packet::Hello(Hello::native(1, b"")).encode();
        // Declare a 5-byte token with none following
        let len_at = 6;
        let len_bytes = match ByteOrder::native() {
            ByteOrder::Little => 5u32.to_le_bytes(),
            ByteOrder::Big => 5u32.to_be_bytes(),
        };
        encoded[len_at..len_at + 4].copy_from_slice(&len_bytes);

        assert_eq!(
            Packet::parse(&encoded),
            Err(FrameError::LengthOverflow {
                declared: 5,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_data_frame_layout() {
        let frame = DataFrame {
            channel: 1,
            kind: Some(1),
            sequence: Some(300),
            more: true,
            payload: b"hi",
        };
        let encoded = Packet::Data(frame).encode();
        assert_eq!(
            encoded,
            vec![0x04, 1, 0b0000_0111, 1, 0xAC, 0x02, 2, b'h', b'i']
        );
        assert_eq!(encoded.len(), Packet::Data(frame).encoded_len());
        assert_eq!(Packet::parse(&encoded).unwrap(), Packet::Data(frame));
    }

    #[test]
    fn test_unreliable_data_has_no_sequence() {
        let frame = data(0, None, b"ctl");
        let encoded = Packet::Data(frame).encode();
        assert_eq!(encoded, vec![0x04, 0, 0, 3, b'c', b't', b'l']);
    }

    #[test]
    fn test_data_reserved_flags_rejected() {
        let encoded = [0x04, 1, 0b1000_0000, 0];
        assert_eq!(
            Packet::parse(&encoded),
            Err(FrameError::InvalidFlags(0b1000_0000))
        );
    }

    #[test]
    fn test_data_length_overflow() {
        // Declares 10 payload bytes, carries 2
        let encoded = [0x04, 1, 0, 10, b'h', b'i'];
        assert_eq!(
            Packet::parse(&encoded),
            Err(FrameError::LengthOverflow {
                declared: 10,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_data_payload_too_large() {
        let mut encoded = vec![0x04, 1, 0];
        write_varint(&mut encoded, (MAX_PAYLOAD_LEN + 1) as u64);
        assert!(matches!(
            Packet::parse(&encoded),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_channel_out_of_range() {
        let mut encoded = vec![0x04];
        write_varint(&mut encoded, 70_000);
        encoded.extend_from_slice(&[0, 0]);
        assert_eq!(
            Packet::parse(&encoded),
            Err(FrameError::FieldOutOfRange {
                field: "channel",
                value: 70_000
            })
        );
    }

    #[test]
    fn test_ack_roundtrip() {
        let packet = Packet::Ack {
            channel: 1,
            sequence: 1024,
        };
        let encoded = packet.encode();
        assert_eq!(encoded, vec![0x05, 1, 0x80, 0x08]);
        assert_eq!(Packet::parse(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_empty_packets() {
        assert_eq!(Packet::Keepalive.encode(), vec![0x06]);
        assert_eq!(Packet::Close.encode(), vec![0x07]);
        assert_eq!(Packet::parse(&[0x06]).unwrap(), Packet::Keepalive);
        assert_eq!(Packet::parse(&[0x07, 0]), Err(FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_reject_reason() {
        let encoded = Packet::Reject("version mismatch").encode();
        assert_eq!(
            Packet::parse(&encoded).unwrap(),
            Packet::Reject("version mismatch")
        );
        assert_eq!(
            Packet::parse(&[0x03, 2, 0xFF, 0xFE]),
            Err(FrameError::InvalidUtf8)
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let mut encoded = Packet::Data(data(1, Some(1), b"x")).encode();
        encoded.push(0);
        assert_eq!(Packet::parse(&encoded), Err(FrameError::TrailingBytes(1)));
    }

    #[test]
    fn test_truncated_packets() {
        assert!(matches!(
            Packet::parse(&[]),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            Packet::parse(&[0x01, 1, 0]),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            Packet::parse(&[0x04, 1]),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            Packet::parse(&[0x05, 0x80]),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_text_roundtrip() {
        for text in ["", "a", "héllo wörld ✓ 日本語 🎉"] {
            let payload = encode_text(text);
            assert_eq!(decode_text(&payload).unwrap(), text);
        }

        let big = "x".repeat(64 * 1024);
        assert_eq!(decode_text(&encode_text(&big)).unwrap(), big);
    }

    #[test]
    fn test_text_decode_errors() {
        assert_eq!(decode_text(&[2, 0xC3, 0x28]), Err(FrameError::InvalidUtf8));
        assert_eq!(decode_text(&[1, b'a', b'b']), Err(FrameError::TrailingBytes(1)));
        assert!(matches!(
            decode_text(&[5, b'a']),
            Err(FrameError::LengthOverflow { .. })
        ));
        assert!(decode_text(&[]).unwrap_err().is_malformed());
    }

    #[test]
    fn test_flags() {
        let flags = FrameFlags::new().with_reliable().with_more();
        assert!(flags.is_reliable());
        assert!(flags.is_more());
        assert!(!flags.is_open());
        assert_eq!(flags.as_u8(), 0b0000_0101);
        assert_eq!(FrameFlags::from_bits(0b0000_0111).unwrap().as_u8(), 7);
        assert!(FrameFlags::from_bits(0b0000_1000).is_err());
    }

    #[test]
    fn test_largest_frames_fit_one_datagram() {
        let payload = vec![0u8; crate::MAX_FRAME_PAYLOAD];
        let frame = DataFrame {
            channel: u16::MAX,
            kind: Some(0xFF),
            sequence: Some(u32::MAX),
            more: true,
            payload: &payload,
        };
        assert_eq!(
            Packet::Data(frame).encoded_len(),
            nettester_transport::MAX_UDP_PAYLOAD
        );

        let token = vec![0u8; crate::MAX_TOKEN_LEN];
        let hello = Hello {
            byte_order: ByteOrder::Little,
            version: 1,
            token: &token,
        };
        assert_eq!(
            Packet::Hello(hello).encoded_len(),
            nettester_transport::MAX_UDP_PAYLOAD
        );
    }
}
