//! Routes Module
//!
//! HTTP route configuration for the server.

pub mod router;

pub use router::create_router;
