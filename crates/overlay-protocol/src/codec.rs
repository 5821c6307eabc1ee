//! Length-delimited JSON codec.
//!
//! Wire format: 4-byte big-endian length prefix + serde JSON payload.
//! Transport handles carry exactly one frame per message; the
//! [`encode_message`] / [`decode_message`] helpers enforce that.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::Message;
use crate::{ProtocolError, MAX_MESSAGE_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Bytes a `Data`/`Reliable` frame spends outside the base64 payload:
/// length prefix plus `{"type":"reliable","payload":""}` with headroom.
pub const DATA_ENVELOPE_BYTES: usize = 64;

/// Codec for framing Message values over a byte stream.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let msg_bytes = src.split_to(length);

        let message: Message = serde_json::from_slice(&msg_bytes)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

/// Encode one message into a standalone transport frame.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    MessageCodec.encode(msg.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a transport frame that must hold exactly one message.
pub fn decode_message(frame: &[u8]) -> Result<Message, ProtocolError> {
    let mut buf = BytesMut::from(frame);
    match MessageCodec.decode(&mut buf)? {
        Some(msg) if buf.is_empty() => Ok(msg),
        Some(_) => Err(ProtocolError::Codec(format!(
            "{} trailing bytes after frame",
            buf.len()
        ))),
        None => Err(ProtocolError::Codec("truncated frame".into())),
    }
}

/// Largest raw payload that fits one data frame on a transport whose
/// messages are capped at `max_message_size` bytes.
pub fn data_capacity(max_message_size: usize) -> usize {
    let budget = max_message_size
        .min(MAX_MESSAGE_BYTES)
        .saturating_sub(DATA_ENVELOPE_BYTES);
    // base64 turns every 3 raw bytes into 4
    (budget / 4) * 3
}
