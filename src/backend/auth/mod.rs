//! Authentication
//!
//! Account passwords, login session tokens and the session cookie pair.
//! Sessions are opaque server-side records; the cookies only carry the
//! user ID and the token.

pub mod accounts;
pub mod sessions;

pub use sessions::{identity_from_cookies, random_token, session_cookies};
