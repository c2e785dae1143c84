//! Frame codec: length-prefixed command frames with optional checksum and
//! payload sections.
//!
//! The decoder is incremental: it consumes whole frames from a receive buffer
//! and leaves any partial tail (down to a single byte of the next frame's
//! length prefix) in place, reporting how many bytes are still missing so the
//! reader can issue an exactly-sized read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::commands::{BrokerEntryMetadata, Command, MessageMetadata};
use crate::error::{ProtocolError, Result};
use crate::{MAGIC_BROKER_ENTRY_METADATA, MAGIC_CRC32C};

/// Hard cap on a single frame; guards the decoder against hostile length
/// prefixes before the negotiated message-size limit applies.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A fully decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// A plain command frame.
    Command(Command),
    /// A payload-bearing frame (`Send` or `Message`).
    Payload {
        command: Command,
        broker_entry_metadata: Option<BrokerEntryMetadata>,
        /// `false` when a checksum was present and did not match. The frame
        /// is still delivered; validation failures are the receiver's call.
        checksum_valid: bool,
        metadata: MessageMetadata,
        payload: Bytes,
    },
}

/// Encode a simple command frame.
pub fn encode_command(cmd: &Command) -> Result<Bytes> {
    let body = postcard::to_allocvec(cmd).map_err(ProtocolError::Serialize)?;
    let total = 4 + body.len();
    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32(total as u32);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Encode a payload-bearing frame (`Send` outbound).
///
/// When `with_checksum` is set, a CRC32C over
/// `metadata_size ‖ metadata ‖ payload` is inserted after the command,
/// preceded by its magic number.
pub fn encode_payload_command(
    cmd: &Command,
    metadata: &MessageMetadata,
    payload: &[u8],
    with_checksum: bool,
) -> Result<Bytes> {
    let cmd_body = postcard::to_allocvec(cmd).map_err(ProtocolError::Serialize)?;
    let md = postcard::to_allocvec(metadata).map_err(ProtocolError::Serialize)?;

    let checksum_len = if with_checksum { 2 + 4 } else { 0 };
    let total = 4 + cmd_body.len() + checksum_len + 4 + md.len() + payload.len();

    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32(total as u32);
    buf.put_u32(cmd_body.len() as u32);
    buf.put_slice(&cmd_body);

    if with_checksum {
        let mut crc = crc32c::crc32c(&(md.len() as u32).to_be_bytes());
        crc = crc32c::crc32c_append(crc, &md);
        crc = crc32c::crc32c_append(crc, payload);
        buf.put_u16(MAGIC_CRC32C);
        buf.put_u32(crc);
    }

    buf.put_u32(md.len() as u32);
    buf.put_slice(&md);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// How many more bytes the buffer needs before [`decode_frame`] can make
/// progress: the missing part of the length prefix, or the missing suffix of
/// the current frame.
pub fn frame_bytes_needed(buf: &[u8]) -> usize {
    if buf.len() < 4 {
        return 4 - buf.len();
    }
    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    (total + 4).saturating_sub(buf.len())
}

fn peek_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Decode one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// partial bytes are left untouched.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(total, MAX_FRAME_SIZE));
    }
    if buf.len() < 4 + total {
        return Ok(None);
    }

    let mut frame = buf.split_to(4 + total).freeze();
    frame.advance(4);

    if frame.remaining() < 4 {
        return Err(ProtocolError::TruncatedFrame { expected: 4, found: frame.remaining() });
    }
    let cmd_size = frame.get_u32() as usize;
    if frame.remaining() < cmd_size {
        return Err(ProtocolError::TruncatedFrame { expected: cmd_size, found: frame.remaining() });
    }
    let cmd_bytes = frame.split_to(cmd_size);
    let command: Command =
        postcard::from_bytes(&cmd_bytes).map_err(ProtocolError::MalformedCommand)?;

    if !command.carries_payload() {
        return Ok(Some(Frame::Command(command)));
    }

    let mut broker_entry_metadata = None;
    if frame.remaining() >= 6 && peek_u16(&frame) == MAGIC_BROKER_ENTRY_METADATA {
        frame.advance(2);
        let meta_size = frame.get_u32() as usize;
        if frame.remaining() < meta_size {
            return Err(ProtocolError::TruncatedFrame {
                expected: meta_size,
                found: frame.remaining(),
            });
        }
        let raw = frame.split_to(meta_size);
        broker_entry_metadata =
            Some(postcard::from_bytes(&raw).map_err(ProtocolError::MalformedMetadata)?);
    }

    let mut checksum_valid = true;
    if frame.remaining() >= 6 && peek_u16(&frame) == MAGIC_CRC32C {
        frame.advance(2);
        let stored = frame.get_u32();
        checksum_valid = crc32c::crc32c(frame.chunk()) == stored;
    }

    if frame.remaining() < 4 {
        return Err(ProtocolError::TruncatedFrame { expected: 4, found: frame.remaining() });
    }
    let metadata_size = frame.get_u32() as usize;
    if frame.remaining() < metadata_size {
        return Err(ProtocolError::TruncatedFrame {
            expected: metadata_size,
            found: frame.remaining(),
        });
    }
    let md_raw = frame.split_to(metadata_size);
    let metadata = postcard::from_bytes(&md_raw).map_err(ProtocolError::MalformedMetadata)?;

    Ok(Some(Frame::Payload { command, broker_entry_metadata, checksum_valid, metadata, payload: frame }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::MessageIdData;

    fn sample_send() -> (Command, MessageMetadata, Bytes) {
        let cmd = Command::Send {
            producer_id: 1,
            sequence_id: 5,
            num_messages: 1,
            highest_sequence_id: None,
        };
        let metadata = MessageMetadata {
            producer_name: "p-1".into(),
            sequence_id: 5,
            publish_time: 1_700_000_000_123,
            ..Default::default()
        };
        (cmd, metadata, Bytes::from_static(b"hello world"))
    }

    #[test]
    fn command_frame_roundtrip() {
        let encoded = encode_command(&Command::Ping).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            Frame::Command(Command::Ping) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_frame_roundtrip_with_checksum() {
        let (cmd, metadata, payload) = sample_send();
        let encoded = encode_payload_command(&cmd, &metadata, &payload, true).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            Frame::Payload { command, checksum_valid, metadata: md, payload: body, .. } => {
                assert_eq!(command, cmd);
                assert!(checksum_valid);
                assert_eq!(md, metadata);
                assert_eq!(body, payload);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum_but_still_decodes() {
        let (cmd, metadata, payload) = sample_send();
        let encoded = encode_payload_command(&cmd, &metadata, &payload, true).unwrap();

        let mut bytes = encoded.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut buf = BytesMut::from(&bytes[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            Frame::Payload { checksum_valid, .. } => assert!(!checksum_valid),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decoder_tolerates_byte_by_byte_arrival() {
        let encoded = encode_command(&Command::Pong).unwrap();
        let mut buf = BytesMut::new();
        for (i, b) in encoded.iter().enumerate() {
            buf.put_u8(*b);
            let frame = decode_frame(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(frame.is_none());
                assert_eq!(frame_bytes_needed(&buf), encoded.len() - i - 1);
            } else {
                assert!(matches!(frame, Some(Frame::Command(Command::Pong))));
            }
        }
    }

    #[test]
    fn partial_tail_of_next_frame_is_preserved() {
        let first = encode_command(&Command::Ping).unwrap();
        let second = encode_command(&Command::Pong).unwrap();

        let mut buf = BytesMut::new();
        buf.put_slice(&first);
        buf.put_slice(&second[..3]); // 3 bytes of the next length prefix

        assert!(matches!(decode_frame(&mut buf).unwrap(), Some(Frame::Command(Command::Ping))));
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
        assert_eq!(frame_bytes_needed(&buf), 1);

        buf.put_slice(&second[3..]);
        assert!(matches!(decode_frame(&mut buf).unwrap(), Some(Frame::Command(Command::Pong))));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u32(0);
        assert!(matches!(decode_frame(&mut buf), Err(ProtocolError::FrameTooLarge(..))));
    }

    #[test]
    fn receipt_roundtrip_preserves_message_id() {
        let cmd = Command::SendReceipt {
            producer_id: 9,
            sequence_id: 1,
            message_id: MessageIdData { ledger_id: 3, entry_id: 14, partition: 2, batch_index: -1 },
            highest_sequence_id: Some(1),
        };
        let encoded = encode_command(&cmd).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        match decode_frame(&mut buf).unwrap().unwrap() {
            Frame::Command(decoded) => assert_eq!(decoded, cmd),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
