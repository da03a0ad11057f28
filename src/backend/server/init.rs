//! Server Initialization
//!
//! Assembly of the server: store selection, board seeding, the feed
//! registry with its flusher, the snapshot cache, admission state, the
//! body parser and the moderation change-feed pump.
//!
//! # Initialization Process
//!
//! 1. Select the store: Postgres when `DATABASE_URL` is set, in-memory
//!    otherwise
//! 2. Seed the configured boards and load the board snapshot
//! 3. Spawn the feed registry and its shared flusher
//! 4. Subscribe to the store change feed for moderation events
//! 5. Build the router

use std::sync::Arc;

use axum::Router;

use crate::backend::admission::Admission;
use crate::backend::cache::frontends::Frontends;
use crate::backend::cache::Cache;
use crate::backend::db::{
    MemStore, PgStore, Store, CHANNEL_POST_MODERATED, CHANNEL_THREAD_DELETED,
};
use crate::backend::feeds::{Feeds, ModerationAction, ModerationEvent};
use crate::backend::parser::Parser;
use crate::backend::routes::router::create_router;
use crate::backend::server::config::Config;
use crate::backend::server::state::{AppState, Boards};

/// Create and configure the application with configuration from the
/// environment
pub async fn create_app() -> Router {
    create_app_with(Config::load()).await
}

/// Create and configure the application
pub async fn create_app_with(config: Config) -> Router {
    tracing::info!("initializing kagami server");

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => match PgStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::error!("connecting to database: {}", err);
                tracing::warn!("falling back to the in-memory store");
                Arc::new(MemStore::new())
            }
        },
        None => Arc::new(MemStore::new()),
    };

    for board in &config.boards {
        if let Err(err) = store.create_board(board).await {
            tracing::error!(board = %board.id, "seeding board: {}", err);
        }
    }
    let boards = Arc::new(Boards::new(
        store.all_board_configs().await.unwrap_or_default(),
    ));
    tracing::info!(count = boards.all().len(), "boards loaded");

    let feeds = Feeds::spawn(config.flush_interval);
    let cache = Arc::new(Cache::new(config.cache_capacity));
    let admission = Arc::new(Admission::new(store.clone(), config.spam.clone()));
    let parser = Arc::new(Parser::new(store.clone()));
    let frontends = Frontends::new(store.clone());

    let state = AppState {
        config: Arc::new(config),
        boards,
        store,
        feeds,
        cache,
        admission,
        parser,
        frontends,
    };

    spawn_moderation_pump(state.clone());
    tracing::info!("router configured");
    create_router(state)
}

/// Pump moderation notifications from the store change feed into the
/// owning feeds. Payload format: `<thread>,<post id>`.
fn spawn_moderation_pump(state: AppState) {
    tokio::spawn(async move {
        let mut moderated = match state.store.listen(CHANNEL_POST_MODERATED).await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::error!("subscribing to moderation feed: {}", err);
                return;
            }
        };
        let mut deleted = match state.store.listen(CHANNEL_THREAD_DELETED).await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::error!("subscribing to deletion feed: {}", err);
                return;
            }
        };

        loop {
            let (msg, action) = tokio::select! {
                msg = moderated.recv() => match msg {
                    Some(msg) => (msg, ModerationAction::DeletePost),
                    None => break,
                },
                msg = deleted.recv() => match msg {
                    Some(msg) => (msg, ModerationAction::DeletePost),
                    None => break,
                },
            };
            match split_thread_and_id(&msg) {
                Some((thread, id)) => {
                    state.cache.clear().await;
                    if let Some(feed) = state.feeds.feed_for_thread(thread) {
                        feed.moderate(ModerationEvent {
                            id,
                            action,
                            by: "system".to_string(),
                        });
                    }
                }
                None => tracing::error!(msg = %msg, "unparsable moderation message"),
            }
        }
    });
}

/// Split a change-feed message containing a thread and post ID
fn split_thread_and_id(msg: &str) -> Option<(u64, u64)> {
    let (thread, id) = msg.split_once(',')?;
    Some((thread.parse().ok()?, id.parse().ok()?))
}
