//! Cache Frontends
//!
//! The standard frontends wiring cache keys to store snapshots: thread,
//! board page, catalog, all-board catalog and single post. Counters
//! come from the store's per-view counters so any post mutation
//! invalidates the containing views.

use std::sync::Arc;

use crate::backend::cache::{FrontEnd, Key};
use crate::backend::db::Store;
use crate::backend::error::BackendError;

/// The standard frontends, built once at startup and shared through
/// the application state
#[derive(Clone)]
pub struct Frontends {
    pub thread: FrontEnd,
    pub board_page: FrontEnd,
    pub catalog: FrontEnd,
    pub all_catalog: FrontEnd,
    pub post: FrontEnd,
}

impl Frontends {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            thread: thread(store.clone()),
            board_page: board_page(store.clone()),
            catalog: catalog(store.clone()),
            all_catalog: all_catalog(store.clone()),
            post: post(store),
        }
    }
}

pub fn thread(store: Arc<dyn Store>) -> FrontEnd {
    let counter_store = store.clone();
    FrontEnd::new(
        Arc::new(move |key: Key| {
            let store = counter_store.clone();
            Box::pin(async move { store.thread_counter(key.id).await })
        }),
        Arc::new(move |key: Key| {
            let store = store.clone();
            Box::pin(async move {
                let thread = store
                    .thread_snapshot(key.id, key.page)
                    .await?
                    .ok_or(BackendError::Store(sqlx::Error::RowNotFound))?;
                Ok(serde_json::to_value(thread)?)
            })
        }),
    )
}

pub fn board_page(store: Arc<dyn Store>) -> FrontEnd {
    let counter_store = store.clone();
    FrontEnd::new(
        Arc::new(move |key: Key| {
            let store = counter_store.clone();
            Box::pin(async move { store.board_counter(&key.board).await })
        }),
        Arc::new(move |key: Key| {
            let store = store.clone();
            Box::pin(async move {
                let page = store.board_snapshot(&key.board, key.page).await?;
                Ok(serde_json::to_value(page)?)
            })
        }),
    )
}

pub fn catalog(store: Arc<dyn Store>) -> FrontEnd {
    let counter_store = store.clone();
    FrontEnd::new(
        Arc::new(move |key: Key| {
            let store = counter_store.clone();
            Box::pin(async move { store.board_counter(&key.board).await })
        }),
        Arc::new(move |key: Key| {
            let store = store.clone();
            Box::pin(async move {
                let catalog = store.catalog_snapshot(&key.board).await?;
                Ok(serde_json::to_value(catalog)?)
            })
        }),
    )
}

pub fn all_catalog(store: Arc<dyn Store>) -> FrontEnd {
    let counter_store = store.clone();
    FrontEnd::new(
        Arc::new(move |_key: Key| {
            let store = counter_store.clone();
            Box::pin(async move { store.all_board_counter().await })
        }),
        Arc::new(move |_key: Key| {
            let store = store.clone();
            Box::pin(async move {
                let catalog = store.all_catalog_snapshot().await?;
                Ok(serde_json::to_value(catalog)?)
            })
        }),
    )
}

pub fn post(store: Arc<dyn Store>) -> FrontEnd {
    let counter_store = store.clone();
    FrontEnd::new(
        Arc::new(move |key: Key| {
            let store = counter_store.clone();
            Box::pin(async move {
                match store.get_post(key.id).await? {
                    Some(post) => store.thread_counter(post.op).await,
                    None => Ok(0),
                }
            })
        }),
        Arc::new(move |key: Key| {
            let store = store.clone();
            Box::pin(async move {
                let post = store
                    .get_post(key.id)
                    .await?
                    .ok_or(BackendError::Store(sqlx::Error::RowNotFound))?;
                Ok(serde_json::to_value(post)?)
            })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cache::{Cache, DEFAULT_CAPACITY};
    use crate::backend::db::MemStore;
    use crate::shared::post::Post;

    #[tokio::test]
    async fn test_board_page_served_and_invalidated() {
        let store = Arc::new(MemStore::new());
        store.write_thread(1, "a", "first", Post::default()).await;
        store
            .write_post(
                crate::shared::StandalonePost {
                    post: Post {
                        id: 2,
                        time: 1,
                        editing: true,
                        body: "ab".to_string(),
                        ..Default::default()
                    },
                    op: 1,
                    board: "a".to_string(),
                },
                None,
            )
            .await;

        let cache = Cache::new(DEFAULT_CAPACITY);
        let frontend = board_page(store.clone());
        let key = Key::board_page("a", 0, true);

        let (_, data, counter) = cache.get_json(key.clone(), &frontend).await.unwrap();
        assert_eq!(data["threads"][0]["id"], 1);

        // A body write bumps the board counter; after the TTL the next
        // read rebuilds against the new counter
        store.set_open_body(2, "abc").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let (_, data, rebuilt) = cache.get_json(key, &frontend).await.unwrap();
        assert!(rebuilt > counter);
        assert_eq!(data["threads"][0]["posts"][0]["body"], "abc");
    }

    #[tokio::test]
    async fn test_thread_frontend_missing_thread_errors() {
        let store = Arc::new(MemStore::new());
        let cache = Cache::new(DEFAULT_CAPACITY);
        let frontend = thread(store);
        assert!(cache
            .get_json(Key::thread(404, 0), &frontend)
            .await
            .is_err());
    }
}
