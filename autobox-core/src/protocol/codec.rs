//! Frame codec: splits a raw byte stream into [`Message`]s and frames
//! outgoing messages.
//!
//! The decoder is resumable: fewer than 16 buffered bytes yields no
//! frame and retains the input for the next read. A header that fails
//! validation advances the stream by a single byte so decoding can
//! resync on the next magic; the caller counts the error as a protocol
//! strike. An oversize declaration consumes only the header — the
//! payload is never awaited.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::AutoboxError;
use crate::protocol::header::FrameHeader;
use crate::protocol::message::Message;

// ── DongleCodec ──────────────────────────────────────────────────

/// Stateful frame decoder / encoder for the dongle byte stream.
#[derive(Debug, Default)]
pub struct DongleCodec {
    /// Validated header whose payload has not fully arrived yet.
    pending: Option<FrameHeader>,
}

impl DongleCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for DongleCodec {
    type Item = Message;
    type Error = AutoboxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, AutoboxError> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < FrameHeader::SIZE {
                    return Ok(None);
                }
                match FrameHeader::decode(&src[..FrameHeader::SIZE]) {
                    Ok(header) => {
                        src.advance(FrameHeader::SIZE);
                        header
                    }
                    Err(err @ AutoboxError::FrameTooLarge { .. }) => {
                        // Reject the declaration without waiting for
                        // payload bytes that may never come.
                        src.advance(FrameHeader::SIZE);
                        return Err(err);
                    }
                    Err(err) => {
                        // Lost sync — slide one byte and let the next
                        // call hunt for the magic again.
                        src.advance(1);
                        return Err(err);
                    }
                }
            }
        };

        let payload_len = header.payload_len as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload: Bytes = src.split_to(payload_len).freeze();
        Message::decode_payload(header.msg_type, payload).map(Some)
    }
}

impl Encoder<Message> for DongleCodec {
    type Error = AutoboxError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), AutoboxError> {
        dst.extend_from_slice(&item.encode_frame());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{FRAME_MAGIC, MAX_FRAME};
    use crate::protocol::message::{CommandValue, MessageTag};

    fn frame(msg: &Message) -> Vec<u8> {
        msg.encode_frame().to_vec()
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut codec = DongleCodec::new();
        let mut buf = BytesMut::from(&frame(&Message::HeartBeat)[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::HeartBeat);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_retains_bytes() {
        let mut codec = DongleCodec::new();
        let full = frame(&Message::Command(CommandValue::WifiPair));

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&full[10..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Command(CommandValue::WifiPair));
    }

    #[test]
    fn partial_payload_resumes() {
        let mut codec = DongleCodec::new();
        let full = frame(&Message::Command(CommandValue::Siri));

        // Header plus half the payload.
        let mut buf = BytesMut::from(&full[..18]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[18..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Command(CommandValue::Siri));
    }

    #[test]
    fn bad_magic_slides_one_byte() {
        let mut codec = DongleCodec::new();
        let mut bytes = vec![0xFFu8]; // one byte of garbage
        bytes.extend_from_slice(&frame(&Message::HeartBeat));
        let mut buf = BytesMut::from(&bytes[..]);

        // First call trips on garbage and consumes exactly one byte.
        assert!(codec.decode(&mut buf).is_err());
        // Then decoding resyncs on the real frame.
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::HeartBeat);
    }

    #[test]
    fn oversize_frame_rejected_without_payload() {
        let mut codec = DongleCodec::new();
        let mut raw = Vec::new();
        raw.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        raw.extend_from_slice(&(MessageTag::VideoData as u32).to_le_bytes());
        raw.extend_from_slice(&((MAX_FRAME as u32) + 1).to_le_bytes());
        raw.extend_from_slice(&((MessageTag::VideoData as u32) ^ 0xFFFF_FFFF).to_le_bytes());
        let mut buf = BytesMut::from(&raw[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(AutoboxError::FrameTooLarge { .. })
        ));
        // Header consumed, nothing else awaited.
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = DongleCodec::new();
        let mut bytes = frame(&Message::HeartBeat);
        bytes.extend_from_slice(&frame(&Message::Unplugged));
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::HeartBeat);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Unplugged);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoder_matches_encode_frame() {
        let mut codec = DongleCodec::new();
        let msg = Message::Command(CommandValue::Frame);
        let mut dst = BytesMut::new();
        codec.encode(msg.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &frame(&msg)[..]);
    }
}
