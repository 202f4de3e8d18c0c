//! Tagged wire framing shared by every connection.
//!
//! A connection carries two interleaved kinds of traffic, each introduced by
//! a single tag byte:
//!
//! ```text
//! control: [0x1][u32 BE length][postcard Message]
//! stream:  [0x2][raw bytes whose length is already known to the reader]
//! ```
//!
//! A fetch reply carries its own size right after the tag
//! (`[0x2][u64 LE size][bytes]`); a store push relies on the `size` of the
//! preceding `StoreFile` message.

use thiserror::Error;

use crate::message::{encode_message, Message};

/// Tag byte introducing a control message.
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Tag byte introducing a raw byte stream.
pub const INCOMING_STREAM: u8 = 0x2;

/// Largest control message body accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the little-endian length header of a fetch reply.
pub const STREAM_SIZE_LEN: usize = 8;

/// The two kinds of traffic a tag byte can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Message,
    Stream,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            INCOMING_MESSAGE => Ok(Tag::Message),
            INCOMING_STREAM => Ok(Tag::Stream),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Tag::Message => INCOMING_MESSAGE,
            Tag::Stream => INCOMING_STREAM,
        }
    }
}

/// Errors raised while framing or unframing control traffic.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control message of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("invalid message encoding: {0}")]
    Encode(#[from] postcard::Error),
}

/// Build a complete control frame (tag, length, body) for `msg`.
pub fn encode_message_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let body = encode_message(msg)?;
    frame_payload(&body)
}

/// Wrap an already-encoded message body in a control frame.
pub fn frame_payload(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(1 + 4 + body.len());
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Validate a control body length read off the wire.
pub fn check_message_len(len: u32) -> Result<usize, FrameError> {
    let len = len as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

/// Header preceding the bytes of a fetch reply: stream tag plus LE size.
pub fn stream_header(size: u64) -> [u8; 1 + STREAM_SIZE_LEN] {
    let mut header = [0u8; 1 + STREAM_SIZE_LEN];
    header[0] = INCOMING_STREAM;
    header[1..].copy_from_slice(&size.to_le_bytes());
    header
}
