//! Message Codec
//!
//! Frame-level encoding and decoding of the typed WebSocket protocol.
//! Every frame is a text frame whose first two bytes are zero-padded
//! decimal digits naming the message type, followed by the payload:
//! JSON for structured messages, bare decimal digits for simple numeric
//! acknowledgements.
//!
//! Multi-frame batches are produced by the feed flusher only and are
//! encoded as a Concat frame whose payload is a JSON array of the child
//! frames as strings. Every frame the server emits round-trips through
//! decode -> encode without loss.

use serde::Serialize;

use crate::shared::error::ProtocolError;

/// Types of the typed message protocol. The numeric values are part of
/// the wire contract with the client and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Server-side diagnostic sent before closing on a protocol error
    Invalid = 0,

    // 1 - 9 modify post model state
    InsertPost = 1,
    InsertImage = 2,
    Append = 3,
    Backspace = 4,
    Splice = 5,
    ClosePost = 6,
    Spoiler = 7,
    /// New post ID acknowledgement to the creating client
    PostId = 8,

    // 10 - 19 are session extras
    /// Invokes no operation. Used as a one-way pseudo-ping.
    Noop = 10,
    /// Current server Unix time, sent on first synchronisation
    ServerTime = 11,
    /// Redirect the client to a specific board
    Redirect = 12,
    /// Notification that the next mutation requires a solved captcha
    Captcha = 14,

    // 20 - 29 are moderation events
    ModeratePost = 20,

    // >= 30 are miscellaneous
    Synchronise = 30,
    Reclaim = 31,
    /// Board configuration block, sent in response to Synchronise
    Configs = 32,
    /// Concatenation of multiple messages to reduce transport overhead
    Concat = 33,
    MeguTv = 34,
    /// Currently synchronised client counts
    SyncCount = 35,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(n: u8) -> Result<Self, ProtocolError> {
        use MessageType::*;
        Ok(match n {
            0 => Invalid,
            1 => InsertPost,
            2 => InsertImage,
            3 => Append,
            4 => Backspace,
            5 => Splice,
            6 => ClosePost,
            7 => Spoiler,
            8 => PostId,
            10 => Noop,
            11 => ServerTime,
            12 => Redirect,
            14 => Captcha,
            20 => ModeratePost,
            30 => Synchronise,
            31 => Reclaim,
            32 => Configs,
            33 => Concat,
            34 => MeguTv,
            35 => SyncCount,
            _ => return Err(ProtocolError::invalid_payload(format!("message type {}", n))),
        })
    }
}

/// Encode a message type and JSON-serialisable payload into a frame
pub fn encode<T: Serialize>(typ: MessageType, payload: &T) -> Result<String, serde_json::Error> {
    let mut frame = format!("{:02}", typ as u8);
    frame.push_str(&serde_json::to_string(payload)?);
    Ok(frame)
}

/// Prepend a message type to an already serialised payload
pub fn prepend_type(typ: MessageType, payload: &str) -> String {
    format!("{:02}{}", typ as u8, payload)
}

/// Split a received frame into its raw type code and payload.
///
/// Frames shorter than the type prefix or with non-digit type bytes are
/// rejected as malformed.
pub fn split_frame(frame: &str) -> Result<(u8, &str), ProtocolError> {
    if frame.len() < 2 || !frame.is_char_boundary(2) {
        return Err(ProtocolError::invalid_payload(frame));
    }
    let (prefix, body) = frame.split_at(2);
    let typ: u8 = prefix
        .parse()
        .map_err(|_| ProtocolError::invalid_payload(frame))?;
    Ok((typ, body))
}

/// Wrap already encoded frames into a single Concat frame
pub fn concat(frames: &[String]) -> Result<String, serde_json::Error> {
    encode(MessageType::Concat, &frames)
}
