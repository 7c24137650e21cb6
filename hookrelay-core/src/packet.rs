//! A framed protocol unit: header plus bincode payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RelayError;
use crate::flags::FrameFlags;
use crate::header::{FrameHeader, HEADER_LENGTH};
use crate::message::{Message, MessageKind};

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Largest complete frame the codec will buffer.
pub const MAX_FRAME_SIZE: usize = HEADER_LENGTH + MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, flags: FrameFlags, payload: Bytes) -> Result<Self, RelayError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut header = FrameHeader::new(kind, flags, payload.len() as u32);
        header.checksum = checksum(&payload);
        Ok(Self { header, payload })
    }

    /// Marshal a message. Bodiless variants produce an empty payload.
    pub fn from_message(message: &Message) -> Result<Self, RelayError> {
        let body = match message {
            Message::Hello(hello) => bincode::serialize(hello)?,
            Message::Event(event) => bincode::serialize(event)?,
            Message::ChannelLost { discarded } => bincode::serialize(discarded)?,
            Message::Call(call) => bincode::serialize(call)?,
            Message::Reply(reply) => bincode::serialize(reply)?,
            Message::Goodbye | Message::Heartbeat => Vec::new(),
        };
        let flags = match message {
            Message::Reply(_) => FrameFlags::REPLY,
            _ => FrameFlags::empty(),
        };
        Self::new(message.kind(), flags, Bytes::from(body))
    }

    /// Unmarshal the payload according to the header's kind.
    pub fn to_message(&self) -> Result<Message, RelayError> {
        let body = &self.payload[..];
        Ok(match self.header.kind {
            MessageKind::Hello => Message::Hello(bincode::deserialize(body)?),
            MessageKind::Goodbye => Message::Goodbye,
            MessageKind::Heartbeat => Message::Heartbeat,
            MessageKind::Event => Message::Event(bincode::deserialize(body)?),
            MessageKind::ChannelLost => Message::ChannelLost {
                discarded: bincode::deserialize(body)?,
            },
            MessageKind::Call => Message::Call(bincode::deserialize(body)?),
            MessageKind::Reply => Message::Reply(bincode::deserialize(body)?),
        })
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.header.flags |= flags;
        self
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn flags(&self) -> FrameFlags {
        self.header.flags
    }

    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.header.sequence = sequence;
    }

    /// Check the payload against the header checksum.
    pub fn validate(&self) -> bool {
        self.header.checksum == checksum(&self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Parse exactly one frame from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        let header = FrameHeader::peek(bytes)?.ok_or(RelayError::InvalidFrameLength {
            expected: HEADER_LENGTH,
            actual: bytes.len(),
        })?;
        if header.payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: header.payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if bytes.len() != header.frame_length() {
            return Err(RelayError::InvalidFrameLength {
                expected: header.frame_length(),
                actual: bytes.len(),
            });
        }
        let frame = Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LENGTH..]),
        };
        if !frame.validate() {
            return Err(RelayError::ChecksumMismatch);
        }
        Ok(frame)
    }

    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }
}

/// First four bytes of the blake3 digest, or 0 for an empty payload.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let digest = blake3::hash(payload);
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
