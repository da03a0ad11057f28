//! Application State Management
//!
//! This module defines the application state structure shared with
//! every handler, and the process-owned board configuration snapshot.
//! There are no ambient globals: the registry, cache and admission
//! maps all live here and are owned by the server top level.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::FromRef;

use crate::backend::admission::Admission;
use crate::backend::cache::frontends::Frontends;
use crate::backend::cache::Cache;
use crate::backend::db::Store;
use crate::backend::feeds::Feeds;
use crate::backend::parser::BodyParser;
use crate::backend::server::config::Config;
use crate::shared::BoardConfig;

/// Snapshot of the per-board runtime configuration. Read-heavy: every
/// synchronise and image insert consults it.
pub struct Boards {
    inner: RwLock<HashMap<String, BoardConfig>>,
}

impl Boards {
    pub fn new(configs: Vec<BoardConfig>) -> Self {
        Self {
            inner: RwLock::new(
                configs
                    .into_iter()
                    .map(|config| (config.id.clone(), config))
                    .collect(),
            ),
        }
    }

    pub fn is_board(&self, id: &str) -> bool {
        self.inner.read().unwrap().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<BoardConfig> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn insert(&self, config: BoardConfig) {
        self.inner
            .write()
            .unwrap()
            .insert(config.id.clone(), config);
    }

    pub fn all(&self) -> Vec<BoardConfig> {
        let mut configs: Vec<BoardConfig> =
            self.inner.read().unwrap().values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }
}

/// Central state container for the server. Cheap to clone; every field
/// is shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub boards: Arc<Boards>,
    pub store: Arc<dyn Store>,
    pub feeds: Arc<Feeds>,
    pub cache: Arc<Cache>,
    pub admission: Arc<Admission>,
    pub parser: Arc<dyn BodyParser>,
    pub frontends: Frontends,
}

impl FromRef<AppState> for Arc<Cache> {
    fn from_ref(state: &AppState) -> Self {
        state.cache.clone()
    }
}

impl FromRef<AppState> for Arc<Feeds> {
    fn from_ref(state: &AppState) -> Self {
        state.feeds.clone()
    }
}
