//! Input Limits and Board Configuration
//!
//! Protocol-level limits on user input and the per-board configuration
//! block sent to clients on synchronisation. The limits are part of the
//! wire contract: the client enforces them optimistically and the server
//! enforces them authoritatively.

use serde::{Deserialize, Serialize};

/// Maximum lengths of various input fields
pub const MAX_LEN_NAME: usize = 50;
pub const MAX_LEN_SUBJECT: usize = 100;
pub const MAX_LEN_BODY: usize = 2000;
pub const MAX_LINES_BODY: usize = 100;
pub const MAX_LEN_PASSWORD: usize = 50;
pub const MAX_LEN_USER_ID: usize = 20;
pub const MAX_LEN_POST_PASSWORD: usize = 100;
pub const MAX_DICE_SIDES: u32 = 10_000;

/// Posts after which a thread stops advancing in board listings
pub const BUMP_LIMIT: u32 = 1000;

/// Exact lengths of cryptographic tokens
pub const LEN_SESSION_TOKEN: usize = 171;
pub const LEN_IMAGE_TOKEN: usize = 86;

/// Version of the typed message protocol. Clients reporting a different
/// version on synchronise receive a bare acknowledgement instead of the
/// configuration block.
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration of a single board, as served to clients in the Configs
/// frame and consulted by the open-post state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board identifier. Case-sensitive.
    pub id: String,
    /// Human-readable board title
    pub title: String,
    /// Image insertion is rejected on text-only boards
    #[serde(default)]
    pub text_only: bool,
    /// Locked boards reject new posts
    #[serde(default)]
    pub locked: bool,
}
