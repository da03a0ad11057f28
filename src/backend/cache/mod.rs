//! Snapshot Cache
//!
//! Fingerprint-keyed cache of rendered board and thread snapshots.
//! Serves the JSON (and optionally HTML) artifact for a key, collapsing
//! identical fetches into one store round-trip and revalidating by the
//! store's per-view counter.
//!
//! # Freshness
//!
//! Each entry stores the counter the artifact was built at and the wall
//! time of the last counter check. Within the counter TTL the entry is
//! served without touching the store. Past the TTL the counter is
//! re-fetched: a match refreshes the TTL, a mismatch discards the entry
//! and rebuilds.
//!
//! # Single-flight
//!
//! At most one build runs per key. Concurrent callers await the same
//! shared future and receive its result; build failures propagate to
//! every waiter and are not cached.
//!
//! # Eviction
//!
//! The cache is bounded by a byte budget. Exceeding it evicts whole
//! least-recently-used entries. `clear` drops all entries atomically;
//! in-flight builds complete but their results are discarded.

pub mod frontends;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::backend::error::BackendError;

/// How long a checked counter stays trusted
const COUNTER_TTL: Duration = Duration::from_secs(1);

/// Default artifact byte budget
pub const DEFAULT_CAPACITY: usize = 64 << 20;

/// The kind of snapshot a key identifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Thread,
    BoardPage,
    Catalog,
    AllCatalog,
    Post,
}

/// Structured cache fingerprint. Keys comparing equal by value hit the
/// same entry; the board ID is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub kind: KeyKind,
    pub board: String,
    pub id: u64,
    pub page: i64,
    pub with_index: bool,
}

impl Key {
    /// A thread snapshot, limited to the last `last` replies when
    /// positive
    pub fn thread(id: u64, last: i64) -> Self {
        Self {
            kind: KeyKind::Thread,
            board: String::new(),
            id,
            page: last,
            with_index: false,
        }
    }

    pub fn board_page(board: &str, page: i64, with_index: bool) -> Self {
        Self {
            kind: KeyKind::BoardPage,
            board: board.to_string(),
            id: 0,
            page,
            with_index,
        }
    }

    pub fn catalog(board: &str) -> Self {
        Self {
            kind: KeyKind::Catalog,
            board: board.to_string(),
            id: 0,
            page: 0,
            with_index: false,
        }
    }

    pub fn all_catalog() -> Self {
        Self {
            kind: KeyKind::AllCatalog,
            board: String::new(),
            id: 0,
            page: 0,
            with_index: false,
        }
    }

    pub fn post(id: u64) -> Self {
        Self {
            kind: KeyKind::Post,
            board: String::new(),
            id,
            page: 0,
            with_index: false,
        }
    }
}

type CounterFn =
    Arc<dyn Fn(Key) -> BoxFuture<'static, Result<u64, BackendError>> + Send + Sync>;
type FreshFn =
    Arc<dyn Fn(Key) -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync>;
type RenderJsonFn = Arc<dyn Fn(&Value) -> Bytes + Send + Sync>;
type RenderHtmlFn = Arc<dyn Fn(&Value, &Bytes) -> Bytes + Send + Sync>;

/// Callbacks a caller supplies to build artifacts for a family of keys
#[derive(Clone)]
pub struct FrontEnd {
    /// Fetch the current freshness counter for the key
    pub get_counter: CounterFn,
    /// Fetch fresh data for the key from the store
    pub get_fresh: FreshFn,
    /// Optional JSON renderer; defaults to `serde_json`
    pub render_json: Option<RenderJsonFn>,
    /// Optional HTML renderer, derived from the data and its JSON
    pub render_html: Option<RenderHtmlFn>,
}

impl FrontEnd {
    pub fn new(get_counter: CounterFn, get_fresh: FreshFn) -> Self {
        Self {
            get_counter,
            get_fresh,
            render_json: None,
            render_html: None,
        }
    }
}

#[derive(Clone)]
struct Built {
    counter: u64,
    data: Value,
    json: Bytes,
    html: Option<Bytes>,
}

type BuildFuture = Shared<BoxFuture<'static, Result<Built, String>>>;

struct Entry {
    counter: u64,
    data: Value,
    json: Bytes,
    html: Option<Bytes>,
    last_checked: Instant,
    lru: u64,
}

impl Entry {
    fn size(&self) -> usize {
        self.json.len() + self.html.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

struct InFlight {
    id: u64,
    generation: u64,
    build: BuildFuture,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Key, Entry>,
    in_flight: HashMap<Key, InFlight>,
    size: usize,
    lru_tick: u64,
    build_tick: u64,
    generation: u64,
}

/// The process-owned snapshot cache
pub struct Cache {
    inner: Mutex<Inner>,
    capacity: usize,
}

enum Action {
    Hit(Bytes, Value, u64),
    Check,
    RenderHtml(Value, Bytes, u64),
    /// Await a build; any waiter that finishes it stores the result
    Await {
        build: BuildFuture,
        build_id: u64,
        generation: u64,
    },
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    /// Serve the JSON artifact, its decoded data and the counter it was
    /// built at
    pub async fn get_json(
        &self,
        key: Key,
        frontend: &FrontEnd,
    ) -> Result<(Bytes, Value, u64), BackendError> {
        self.get(key, frontend, false).await
    }

    /// Serve the HTML artifact, rendering and memoising it if the entry
    /// only has JSON yet
    pub async fn get_html(
        &self,
        key: Key,
        frontend: &FrontEnd,
    ) -> Result<(Bytes, Value, u64), BackendError> {
        self.get(key, frontend, true).await
    }

    /// Drop all entries. In-flight builds complete but their results
    /// are not stored.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.size = 0;
        inner.generation += 1;
    }

    async fn get(
        &self,
        key: Key,
        frontend: &FrontEnd,
        want_html: bool,
    ) -> Result<(Bytes, Value, u64), BackendError> {
        loop {
            let action = self.plan(&key, frontend, want_html).await;
            match action {
                Action::Hit(artifact, data, counter) => return Ok((artifact, data, counter)),
                Action::Check => {
                    let counter = (frontend.get_counter)(key.clone()).await?;
                    let mut inner = self.inner.lock().await;
                    match inner.entries.get_mut(&key) {
                        Some(entry) if entry.counter == counter => {
                            entry.last_checked = Instant::now();
                        }
                        Some(_) => {
                            if let Some(entry) = inner.entries.remove(&key) {
                                inner.size -= entry.size();
                            }
                        }
                        None => {}
                    }
                }
                Action::RenderHtml(data, json, counter) => {
                    let render = frontend
                        .render_html
                        .as_ref()
                        .ok_or_else(|| BackendError::cache("no HTML renderer"))?;
                    let html = render(&data, &json);
                    let mut inner = self.inner.lock().await;
                    let mut grew = 0;
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        if entry.counter == counter && entry.html.is_none() {
                            entry.html = Some(html.clone());
                            grew = html.len();
                        }
                    }
                    if grew > 0 {
                        inner.size += grew;
                        self.evict(&mut inner);
                    }
                    return Ok((html, data, counter));
                }
                Action::Await {
                    build,
                    build_id,
                    generation,
                } => {
                    let result = build.await;
                    // First finishing waiter retires the build. Build
                    // failures are not cached.
                    let mut inner = self.inner.lock().await;
                    if inner.in_flight.get(&key).map(|f| f.id) == Some(build_id) {
                        inner.in_flight.remove(&key);
                        if let Ok(built) = &result {
                            if inner.generation == generation {
                                self.store_entry(&mut inner, key.clone(), built.clone());
                            }
                        }
                    }
                    drop(inner);
                    let built = result.map_err(BackendError::cache)?;
                    match (want_html, built.html) {
                        (false, _) => return Ok((built.json, built.data, built.counter)),
                        (true, Some(html)) => return Ok((html, built.data, built.counter)),
                        // A JSON-only build was in flight; render on the
                        // next pass over the stored entry. Yield so the
                        // creator gets to store it first.
                        (true, None) => tokio::task::yield_now().await,
                    }
                }
            }
        }
    }

    /// Decide the next step for a lookup while holding the lock
    async fn plan(&self, key: &Key, frontend: &FrontEnd, want_html: bool) -> Action {
        let mut inner = self.inner.lock().await;
        if let Some(in_flight) = inner.in_flight.get(key) {
            return Action::Await {
                build: in_flight.build.clone(),
                build_id: in_flight.id,
                generation: in_flight.generation,
            };
        }

        inner.lru_tick += 1;
        let tick = inner.lru_tick;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.lru = tick;
            // HTML is only derived from stored JSON once the entry has
            // passed the same counter revalidation as a JSON read
            let fresh = entry.last_checked.elapsed() < COUNTER_TTL;
            match (want_html, entry.html.clone()) {
                (true, None) if fresh => {
                    return Action::RenderHtml(
                        entry.data.clone(),
                        entry.json.clone(),
                        entry.counter,
                    )
                }
                (true, Some(html)) if fresh => {
                    return Action::Hit(html, entry.data.clone(), entry.counter)
                }
                (false, _) if fresh => {
                    return Action::Hit(entry.json.clone(), entry.data.clone(), entry.counter)
                }
                _ => return Action::Check,
            }
        }

        inner.build_tick += 1;
        let build = Self::build_future(key.clone(), frontend.clone(), want_html);
        let in_flight = InFlight {
            id: inner.build_tick,
            generation: inner.generation,
            build: build.clone(),
        };
        let action = Action::Await {
            build,
            build_id: in_flight.id,
            generation: in_flight.generation,
        };
        inner.in_flight.insert(key.clone(), in_flight);
        action
    }

    fn build_future(key: Key, frontend: FrontEnd, want_html: bool) -> BuildFuture {
        let future: BoxFuture<'static, Result<Built, String>> = Box::pin(async move {
            let counter = (frontend.get_counter)(key.clone())
                .await
                .map_err(|err| err.to_string())?;
            let data = (frontend.get_fresh)(key)
                .await
                .map_err(|err| err.to_string())?;
            let json = match &frontend.render_json {
                Some(render) => render(&data),
                None => Bytes::from(serde_json::to_vec(&data).map_err(|err| err.to_string())?),
            };
            let html = match (&frontend.render_html, want_html) {
                (Some(render), true) => Some(render(&data, &json)),
                _ => None,
            };
            Ok(Built {
                counter,
                data,
                json,
                html,
            })
        });
        future.shared()
    }

    fn store_entry(&self, inner: &mut Inner, key: Key, built: Built) {
        inner.lru_tick += 1;
        let entry = Entry {
            counter: built.counter,
            data: built.data,
            json: built.json,
            html: built.html,
            last_checked: Instant::now(),
            lru: inner.lru_tick,
        };
        inner.size += entry.size();
        if let Some(old) = inner.entries.insert(key, entry) {
            inner.size -= old.size();
        }
        self.evict(inner);
    }

    /// Evict least-recently-used entries until the byte budget holds.
    /// In-flight builds are untouched.
    fn evict(&self, inner: &mut Inner) {
        while inner.size > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.lru)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    if let Some(entry) = inner.entries.remove(&key) {
                        inner.size -= entry.size();
                    }
                }
                None => break,
            }
        }
    }
}
