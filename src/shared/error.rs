//! Protocol Error Taxonomy
//!
//! Errors surfaced at the core boundary of the post-update pipeline.
//! The taxonomy distinguishes guard failures, which are returned to the
//! current command and leave the session open, from protocol violations,
//! which terminate the session.
//!
//! # Propagation Policy
//!
//! - Codec and frame errors terminate the session.
//! - Routing errors on Synchronise terminate the session with a
//!   diagnostic.
//! - Open-post guard failures reject the current operation only.
//! - Buffer overflow terminates: a slow client must reconnect and
//!   re-sync from the store rather than receive reordered frames.

use thiserror::Error;

/// Errors of the typed message protocol and the open-post state machine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Non-text opcode or malformed frame prefix
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame well-formed but the body fails its schema
    #[error("invalid message: {0}")]
    InvalidPayload(String),

    /// Synchronise named an unknown board
    #[error("invalid board: {0}")]
    InvalidBoard(String),

    /// Synchronise named a thread that does not exist on the board
    #[error("invalid thread: {id} on /{board}/")]
    InvalidThread { id: u64, board: String },

    /// Admission rejected the client
    #[error("banned: {0}")]
    Banned(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Spam threshold reached; the current operation is rejected until
    /// the client solves a captcha
    #[error("captcha required")]
    CaptchaRequired,

    #[error("post body too long")]
    BodyTooLong,

    #[error("too many lines in post body")]
    TooManyLines,

    #[error("body contains NUL byte")]
    ContainsNull,

    #[error("contains non-printable character: {0}")]
    NotPrintable(u32),

    #[error("invalid splice coordinates: start={start} len={len} in body of {body_len} runes")]
    InvalidSpliceCoords { start: u64, len: u64, body_len: usize },

    /// Splice that changes nothing. Client-side error.
    #[error("splice NOOP")]
    SpliceNoop,

    #[error("splice text too long")]
    SpliceTooLong,

    #[error("no post open")]
    NoPostOpen,

    #[error("post body empty")]
    EmptyPost,

    #[error("post already has image")]
    HasImage,

    #[error("post does not have an image")]
    NoImage,

    #[error("image already spoilered")]
    AlreadySpoilered,

    #[error("text only board")]
    TextOnly,

    /// Client consumed outbound frames too slowly
    #[error("send buffer overflow")]
    BufferOverflow,

    #[error("invalid credentials")]
    InvalidCreds,
}

impl ProtocolError {
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame(message.into())
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// Whether this error terminates the session. Guard failures are
    /// returned to the current command and leave the session open.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrame(_)
                | Self::InvalidPayload(_)
                | Self::InvalidBoard(_)
                | Self::InvalidThread { .. }
                | Self::Banned(_)
                | Self::AccessDenied(_)
                | Self::BufferOverflow
        )
    }
}
