//! Backend Module
//!
//! Server-side code: the WebSocket post-update pipeline, the feed
//! registry, the snapshot cache, admission, persistence and the HTTP
//! surface.

pub mod admission;
pub mod auth;
pub mod cache;
pub mod db;
pub mod error;
pub mod feeds;
pub mod parser;
pub mod routes;
pub mod server;
pub mod websocket;
