//! Feed Registry
//!
//! Process-owned mapping from sync target to [`Feed`], plus the single
//! flusher task that walks the registry on a fixed tick and drains
//! every feed's buffer. One shared ticker bounds scheduler load while
//! preserving per-feed frame ordering.
//!
//! A client is in at most one feed: `sync_client` atomically removes it
//! from its previous feed and inserts it into the target. Feeds are
//! created on first subscribe and destroyed on last unsubscribe.

pub mod feed;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::websocket::client::ClientHandle;
use crate::shared::message::{encode, MessageType};

pub use feed::{Feed, ModerationAction, ModerationEvent, SyncCounts};

/// Default interval of the shared flush ticker
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// What a feed is keyed by: a thread, or a whole board for clients
/// synced to an index page (thread 0)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FeedKey {
    Thread(u64),
    Board(String),
}

impl FeedKey {
    fn new(thread: u64, board: &str) -> Self {
        if thread == 0 {
            Self::Board(board.to_string())
        } else {
            Self::Thread(thread)
        }
    }
}

/// The feed registry and its shared flusher
pub struct Feeds {
    feeds: Mutex<HashMap<FeedKey, Arc<Feed>>>,
    /// MeguTV watcher roster, independent of thread sync
    tv_watchers: Mutex<Vec<Arc<ClientHandle>>>,
}

impl Feeds {
    /// Create the registry and spawn its flusher task
    pub fn spawn(flush_interval: Duration) -> Arc<Self> {
        let feeds = Arc::new(Self {
            feeds: Mutex::new(HashMap::new()),
            tv_watchers: Mutex::new(Vec::new()),
        });
        let walker = feeds.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                walker.flush_all();
            }
        });
        feeds
    }

    /// Atomically move a client to the feed for (thread, board),
    /// creating it on first subscribe. Returns the target feed.
    pub fn sync_client(
        &self,
        client: &Arc<ClientHandle>,
        thread: u64,
        board: &str,
    ) -> Arc<Feed> {
        let key = FeedKey::new(thread, board);
        let feed = {
            let mut feeds = self.feeds.lock().unwrap();
            if let Some((old_thread, old_board)) = client.sync_target() {
                let old_key = FeedKey::new(old_thread, &old_board);
                if old_key != key {
                    if let Some(old) = feeds.get(&old_key) {
                        if old.remove_client(client.id()) {
                            feeds.remove(&old_key);
                        }
                    }
                }
            }
            feeds
                .entry(key)
                .or_insert_with(|| Arc::new(Feed::new(thread, board)))
                .clone()
        };
        feed.add_client(client.clone());
        client.set_sync_target(Some((thread, board.to_string())));
        feed
    }

    /// Remove a disconnecting client from its feed and the TV roster
    pub fn remove_client(&self, client: &Arc<ClientHandle>) {
        if let Some((thread, board)) = client.sync_target() {
            let key = FeedKey::new(thread, &board);
            let mut feeds = self.feeds.lock().unwrap();
            if let Some(feed) = feeds.get(&key) {
                if feed.remove_client(client.id()) {
                    feeds.remove(&key);
                }
            }
        }
        client.set_sync_target(None);
        self.unsubscribe_tv(client.id());
    }

    /// The sync target of a client, if it is synced
    pub fn get_sync(&self, client: &Arc<ClientHandle>) -> Option<(u64, String)> {
        client.sync_target()
    }

    /// The feed a thread's updates go to, if anyone is subscribed
    pub fn feed_for_thread(&self, thread: u64) -> Option<Arc<Feed>> {
        let feeds = self.feeds.lock().unwrap();
        feeds.get(&FeedKey::Thread(thread)).cloned()
    }

    /// Drop every feed. Test hook.
    pub fn clear(&self) {
        self.feeds.lock().unwrap().clear();
        self.tv_watchers.lock().unwrap().clear();
    }

    fn flush_all(&self) {
        let feeds: Vec<Arc<Feed>> = {
            let feeds = self.feeds.lock().unwrap();
            feeds.values().cloned().collect()
        };
        for feed in feeds {
            feed.flush_and_send();
        }
    }

    /// Subscribe a client to the MeguTV roster and tell every watcher
    /// the new count
    pub fn subscribe_tv(&self, client: Arc<ClientHandle>) {
        let watchers = {
            let mut tv = self.tv_watchers.lock().unwrap();
            if !tv.iter().any(|watcher| watcher.id() == client.id()) {
                tv.push(client);
            }
            tv.clone()
        };
        Self::notify_tv(&watchers);
    }

    fn unsubscribe_tv(&self, id: u64) {
        let watchers = {
            let mut tv = self.tv_watchers.lock().unwrap();
            let before = tv.len();
            tv.retain(|watcher| watcher.id() != id);
            if tv.len() == before {
                return;
            }
            tv.clone()
        };
        Self::notify_tv(&watchers);
    }

    fn notify_tv(watchers: &[Arc<ClientHandle>]) {
        if let Ok(frame) = encode(
            MessageType::MeguTv,
            &serde_json::json!({ "watching": watchers.len() }),
        ) {
            for watcher in watchers {
                watcher.send(frame.clone());
            }
        }
    }
}
