//! Kagami - Main Library
//!
//! Kagami is an anonymous imageboard server with realtime post
//! editing: every keystroke of an open post is streamed to all thread
//! subscribers over WebSockets.
//!
//! # Module Structure
//!
//! - **`shared`** - Types shared between the server core and the wire
//!   protocol: transport types, the message codec, input limits and the
//!   protocol error taxonomy
//! - **`backend`** - Server-side code: the WebSocket post-update
//!   pipeline, per-thread feeds with a shared flusher, the snapshot
//!   cache, admission and persistence
//!
//! # Usage
//!
//! ```rust,no_run
//! use kagami::backend::server::create_app;
//!
//! # async fn example() {
//! let app = create_app().await;
//! // Serve app with Axum
//! # }
//! ```
//!
//! # Thread Safety
//!
//! All process-wide state (the feed registry, the snapshot cache, the
//! admission maps) is owned by the server top level and guarded by
//! short-critical-section locks; no task holds a lock across I/O.

pub mod backend;
pub mod shared;
