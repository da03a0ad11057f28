//! Server Module
//!
//! Configuration loading, the shared application state and server
//! initialization.

pub mod config;
pub mod init;
pub mod state;

pub use config::Config;
pub use init::{create_app, create_app_with};
pub use state::{AppState, Boards};
