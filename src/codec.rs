use crate::config::{MAX_MESSAGE_SIZE, MSG_HEADER_SIZE, PKG_HEADER_SIZE};
use crate::message::{Message, MessageType};
use bytes::{BufMut, Bytes, BytesMut};
use crc::Crc;
use thiserror::Error;

/// Wire format of a framed datagram, all numbers big-endian:
/// ```ascii
/// 0:  crc32 (u32) - IEEE polynomial, computed over everything that follows
/// 4:  type (u8)
/// 5:  seq (u32)
/// 9:  len (u32) - length of the body
/// 13: body (len bytes)
/// ```
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than a minimal frame")]
    TooShort(usize),
    #[error("checksum mismatch")]
    Corrupt,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("declared body length {0} exceeds the maximum of {MAX_MESSAGE_SIZE}")]
    Oversize(u32),
    #[error("declared body length {declared} but {actual} bytes on the wire")]
    Truncated { declared: u32, actual: usize },
}

fn crc32() -> Crc<u32> {
    Crc::<u32>::new(&crc::CRC_32_ISO_HDLC)
}

/// Frames a message into a datagram. The result is cached on the message so
///  a retransmission puts the identical bytes on the wire.
pub fn encode(msg: &Message) -> Bytes {
    if let Some(frame) = msg.encoded() {
        return frame;
    }

    let mut buf = BytesMut::with_capacity(msg.total_framed_size());
    buf.put_u32(0); // checksum, patched below
    buf.put_u8(msg.msg_type.into());
    buf.put_u32(msg.seq);
    buf.put_u32(msg.body.len() as u32);
    buf.put_slice(&msg.body);

    let checksum = crc32().checksum(&buf[PKG_HEADER_SIZE..]);
    buf[..PKG_HEADER_SIZE].copy_from_slice(&checksum.to_be_bytes());

    let frame = buf.freeze();
    msg.cache_encoded(frame.clone());
    frame
}

/// Parses and verifies a datagram. The returned message carries no
///  transmission state; that is owned by the sending side.
pub fn decode(datagram: &[u8]) -> Result<Message, WireError> {
    if datagram.len() < PKG_HEADER_SIZE + MSG_HEADER_SIZE {
        return Err(WireError::TooShort(datagram.len()));
    }

    let declared_crc = u32::from_be_bytes(datagram[..PKG_HEADER_SIZE].try_into().unwrap());
    if crc32().checksum(&datagram[PKG_HEADER_SIZE..]) != declared_crc {
        return Err(WireError::Corrupt);
    }

    let header = &datagram[PKG_HEADER_SIZE..];
    let msg_type =
        MessageType::try_from(header[0]).map_err(|_| WireError::UnknownType(header[0]))?;
    let seq = u32::from_be_bytes(header[1..5].try_into().unwrap());
    let len = u32::from_be_bytes(header[5..9].try_into().unwrap());

    if len > MAX_MESSAGE_SIZE as u32 {
        return Err(WireError::Oversize(len));
    }
    let body = &datagram[PKG_HEADER_SIZE + MSG_HEADER_SIZE..];
    if body.len() != len as usize {
        return Err(WireError::Truncated {
            declared: len,
            actual: body.len(),
        });
    }

    Ok(Message::new(msg_type, seq, Bytes::copy_from_slice(body)))
}
