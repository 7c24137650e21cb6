//! Length-delimited framing for `tokio_util::codec::Framed`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RelayError;
use crate::header::{FrameHeader, HEADER_LENGTH};
use crate::packet::{Frame, MAX_PAYLOAD_SIZE};

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayCodec;

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match FrameHeader::peek(src)? {
            Some(h) => h,
            None => return Ok(None),
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let frame_len = header.frame_length();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LENGTH);
        let payload = src.split_to(payload_len).freeze();
        let frame = Frame::from_parts(header, payload);
        if !frame.validate() {
            return Err(RelayError::ChecksumMismatch);
        }
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for RelayCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = Frame::from_message(&Message::ChannelLost { discarded: 3 }).unwrap();
        let bytes = frame.to_bytes();

        let mut codec = RelayCodec;
        let mut buf = BytesMut::from(&bytes[..HEADER_LENGTH + 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[HEADER_LENGTH + 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = RelayCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::from_message(&Message::Heartbeat).unwrap(), &mut buf)
            .unwrap();
        codec
            .encode(Frame::from_message(&Message::Goodbye).unwrap(), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.to_message().unwrap(), Message::Heartbeat);
        assert_eq!(second.to_message().unwrap(), Message::Goodbye);
    }

    #[test]
    fn zero_checksum_is_checked_like_any_other() {
        let frame = Frame::from_message(&Message::ChannelLost { discarded: 1 }).unwrap();
        let mut bytes = frame.to_bytes();
        bytes[4..8].copy_from_slice(&[0, 0, 0, 0]);

        // Zero is a legal blake3 prefix; only a mismatch against the
        // payload is an error, and the whole frame is consumed first.
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            RelayCodec.decode(&mut buf),
            Err(RelayError::ChecksumMismatch)
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn decodes_from_chunked_reader() {
        let a = Frame::from_message(&Message::ChannelLost { discarded: 7 }).unwrap();
        let b = Frame::from_message(&Message::Goodbye).unwrap();
        let a_bytes = a.to_bytes();
        let (head, tail) = a_bytes.split_at(5);

        let reader = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .read(&b.to_bytes())
            .build();
        let mut framed = FramedRead::new(reader, RelayCodec);

        assert_eq!(framed.next().await.unwrap().unwrap(), a);
        assert_eq!(framed.next().await.unwrap().unwrap(), b);
        assert!(framed.next().await.is_none());
    }
}
