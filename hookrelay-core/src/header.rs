//! Fixed-size frame header.
//!
//! ```text
//! magic:          [u8; 4]  "HKR1"
//! checksum:       u32      first 4 bytes of blake3(payload), 0 if empty
//! kind:           u16      MessageKind
//! flags:          u16      FrameFlags
//! sequence:       u64      stamped by the channel writer
//! payload_length: u32
//! ```
//!
//! All integers are little-endian.

use crate::error::RelayError;
use crate::flags::FrameFlags;
use crate::message::MessageKind;

pub const MAGIC: [u8; 4] = *b"HKR1";
pub const HEADER_LENGTH: usize = 24;

pub type FrameHeaderBytes = [u8; HEADER_LENGTH];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub kind: MessageKind,
    pub flags: FrameFlags,
    pub sequence: u64,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(kind: MessageKind, flags: FrameFlags, payload_length: u32) -> Self {
        Self {
            checksum: 0,
            kind,
            flags,
            sequence: 0,
            payload_length,
        }
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut out: FrameHeaderBytes = [0; HEADER_LENGTH];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        out[8..10].copy_from_slice(&(self.kind as u16).to_le_bytes());
        out[10..12].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[12..20].copy_from_slice(&self.sequence.to_le_bytes());
        out[20..24].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, RelayError> {
        if bytes[0..4] != MAGIC {
            return Err(RelayError::InvalidMagic);
        }
        Ok(Self {
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            kind: MessageKind::try_from(u16::from_le_bytes([bytes[8], bytes[9]]))?,
            flags: FrameFlags::from_wire(u16::from_le_bytes([bytes[10], bytes[11]]))?,
            sequence: u64::from_le_bytes([
                bytes[12], bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18],
                bytes[19],
            ]),
            payload_length: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        })
    }

    /// Parse the header at the front of `src` if enough bytes are present.
    pub fn peek(src: &[u8]) -> Result<Option<Self>, RelayError> {
        match src.get(..HEADER_LENGTH) {
            Some(head) => {
                let mut bytes: FrameHeaderBytes = [0; HEADER_LENGTH];
                bytes.copy_from_slice(head);
                Self::from_bytes(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Total encoded length of the frame this header describes.
    pub fn frame_length(&self) -> usize {
        HEADER_LENGTH + self.payload_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes_roundtrip() {
        let mut hdr = FrameHeader::new(MessageKind::Event, FrameFlags::COALESCED, 77);
        hdr.sequence = 9;
        hdr.checksum = 0xdead_beef;
        let decoded = FrameHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = FrameHeader::new(MessageKind::Heartbeat, FrameFlags::empty(), 0).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(RelayError::InvalidMagic)
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut bytes = FrameHeader::new(MessageKind::Heartbeat, FrameFlags::empty(), 0).to_bytes();
        bytes[8..10].copy_from_slice(&0x7777u16.to_le_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(RelayError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn peek_needs_full_header() {
        let bytes = FrameHeader::new(MessageKind::Goodbye, FrameFlags::empty(), 0).to_bytes();
        assert!(FrameHeader::peek(&bytes[..10]).unwrap().is_none());
        assert!(FrameHeader::peek(&bytes).unwrap().is_some());
    }
}
