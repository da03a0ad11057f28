//! Backend Error Module
//!
//! This module defines error types specific to the server. These errors
//! wrap the protocol taxonomy, persistence failures and WebSocket
//! transport errors, and carry the policy for surfacing them: the close
//! code sent to the client and whether the error is worth logging.
//!
//! # Module Structure
//!
//! - **`types`** - Error type definitions and constructors
//! - **`conversion`** - Close-code mapping, ignorable classification and
//!   HTTP response conversion

pub mod conversion;
pub mod types;

pub use types::BackendError;
