//! Per-Thread Feed
//!
//! The broadcast fan-out for one thread (or one board page). Outbound
//! frames accumulate in a buffer between flush ticks; on flush the
//! buffer is wrapped in a single Concat frame and written to every
//! subscriber through its non-blocking send.
//!
//! The feed also mirrors the in-progress body of every open post so a
//! newly joining subscriber can be caught up with synthetic frames
//! instead of a store round-trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::websocket::client::ClientHandle;
use crate::shared::message::{concat, encode, MessageType};
use crate::shared::post::Post;

/// Window within which a client's last post still counts it active
const ACTIVE_WINDOW_SECS: i64 = 30 * 60;

/// Currently synchronised client counts, broadcast as SyncCount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub active: usize,
    pub total: usize,
}

/// A moderation event fanned into the feed from the store change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationEvent {
    pub id: u64,
    pub action: ModerationAction,
    pub by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    DeletePost,
    DeleteImage,
    Ban,
}

#[derive(Default)]
struct FeedState {
    clients: Vec<Arc<ClientHandle>>,
    /// Encoded frames awaiting the next flush, in append order
    pending: Vec<String>,
    /// Latest in-progress body per open post, coalesced between ticks
    open_bodies: HashMap<u64, String>,
}

/// The update feed of one thread, or of one board page when `thread`
/// is 0
pub struct Feed {
    thread: u64,
    board: String,
    state: Mutex<FeedState>,
}

impl Feed {
    pub fn new(thread: u64, board: &str) -> Self {
        Self {
            thread,
            board: board.to_string(),
            state: Mutex::new(FeedState::default()),
        }
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    /// Append an encoded frame to the broadcast buffer
    pub fn write(&self, frame: String) {
        let mut state = self.state.lock().unwrap();
        state.pending.push(frame);
    }

    /// Drain the buffer into a single Concat frame, if any frames are
    /// pending
    pub fn flush(&self) -> Option<String> {
        let pending = {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_empty() {
                return None;
            }
            std::mem::take(&mut state.pending)
        };
        concat(&pending).ok()
    }

    /// Flush the buffer and fan it out to every subscriber
    pub fn flush_and_send(&self) {
        if let Some(frame) = self.flush() {
            let clients = self.state.lock().unwrap().clients.clone();
            for client in clients {
                client.send(frame.clone());
            }
        }
    }

    /// Subscribe a client and catch it up: the open-post bodies as
    /// synthetic full-body splices, then the current sync counts.
    ///
    /// Frames buffered before the join are flushed to the existing
    /// subscribers in the same critical section, so the joiner never
    /// receives a frame that predates its catch-up state.
    pub fn add_client(&self, client: Arc<ClientHandle>) {
        let (pre_join, existing, catch_up) = {
            let mut state = self.state.lock().unwrap();
            let pending = std::mem::take(&mut state.pending);
            let pre_join = if pending.is_empty() {
                None
            } else {
                concat(&pending).ok()
            };
            let existing = state.clients.clone();
            // Re-syncing to the same feed must not duplicate the entry
            state.clients.retain(|c| c.id() != client.id());
            state.clients.push(client.clone());

            let mut frames: Vec<String> = state
                .open_bodies
                .iter()
                .filter_map(|(id, body)| {
                    encode(
                        MessageType::Splice,
                        &serde_json::json!({
                            "id": id,
                            "start": 0,
                            "len": -1,
                            "text": body,
                        }),
                    )
                    .ok()
                })
                .collect();
            frames.sort();
            let counts = Self::counts(&state);
            if let Ok(frame) = encode(MessageType::SyncCount, &counts) {
                frames.push(frame.clone());
                // Everyone else learns the new count on the next tick
                state.pending.push(frame);
            }
            // Board-level feeds carry no open posts; their subscribers
            // get the counts on the next tick instead of a catch-up
            let catch_up = if self.thread != 0 {
                concat(&frames).ok()
            } else {
                None
            };
            (pre_join, existing, catch_up)
        };

        if let Some(frame) = pre_join {
            for subscriber in &existing {
                subscriber.send(frame.clone());
            }
        }
        if let Some(frame) = catch_up {
            client.send(frame);
        }
    }

    /// Remove a client. Returns true when the feed has no subscribers
    /// left and should be destroyed.
    pub fn remove_client(&self, id: u64) -> bool {
        let empty = {
            let mut state = self.state.lock().unwrap();
            state.clients.retain(|client| client.id() != id);
            state.clients.is_empty()
        };
        if !empty {
            self.broadcast_sync_counts();
        }
        empty
    }

    fn counts(state: &FeedState) -> SyncCounts {
        let horizon = Utc::now().timestamp() - ACTIVE_WINDOW_SECS;
        let active = state
            .clients
            .iter()
            .filter(|client| client.last_time() > horizon)
            .count();
        SyncCounts {
            active,
            total: state.clients.len(),
        }
    }

    /// Queue the current sync counts for broadcast on the next tick
    fn broadcast_sync_counts(&self) {
        let mut state = self.state.lock().unwrap();
        let counts = Self::counts(&state);
        if let Ok(frame) = encode(MessageType::SyncCount, &counts) {
            state.pending.push(frame);
        }
    }

    /// A new post was inserted or reclaimed into the thread
    pub fn insert_post(&self, post: &Post, frame: String) {
        let mut state = self.state.lock().unwrap();
        if post.editing {
            state.open_bodies.insert(post.id, post.body.clone());
        }
        state.pending.push(frame);
    }

    /// Mirror the latest in-progress body and queue its frame. Bodies
    /// are coalesced: only the newest per post survives between ticks.
    pub fn set_open_body(&self, id: u64, body: &str, frame: String) {
        let mut state = self.state.lock().unwrap();
        state.open_bodies.insert(id, body.to_string());
        state.pending.push(frame);
    }

    pub fn insert_image(&self, _id: u64, frame: String) {
        self.write(frame);
    }

    pub fn spoiler_image(&self, _id: u64, frame: String) {
        self.write(frame);
    }

    /// A post finished editing; drop its body mirror
    pub fn close_post(&self, id: u64, frame: String) {
        let mut state = self.state.lock().unwrap();
        state.open_bodies.remove(&id);
        state.pending.push(frame);
    }

    /// Fan a moderation event into the feed
    pub fn moderate(&self, event: ModerationEvent) {
        let mut state = self.state.lock().unwrap();
        if event.action == ModerationAction::DeletePost {
            state.open_bodies.remove(&event.id);
        }
        if let Ok(frame) = encode(MessageType::ModeratePost, &event) {
            state.pending.push(frame);
        }
    }

    /// Current subscriber counts; used by the sync tests
    pub fn sync_counts(&self) -> SyncCounts {
        Self::counts(&self.state.lock().unwrap())
    }
}
