//! Store contract integration tests
//!
//! Exercises the in-memory store implementation through the `Store`
//! trait the pipeline is written against.

mod common;

use kagami::backend::db::{ClosePost, MemStore, Store};

use common::sample_post;

#[tokio::test]
async fn test_reclaimed_body_equals_last_persisted() {
    let store = MemStore::new();
    store.write_thread(1, "a", "sub", Default::default()).await;
    store.write_post(sample_post(2, 1, "a", ""), None).await;

    // The author types, the body is persisted, the author vanishes
    for body in ["a", "ab", "abc"] {
        store.set_open_body(2, body).await.unwrap();
    }
    store.release_post(2).await.unwrap();

    // The reclaiming session observes exactly the last persisted body
    assert!(store.claim_post(2).await.unwrap());
    let post = store.get_post(2).await.unwrap().unwrap();
    assert_eq!(post.post.body, "abc");
    assert!(post.post.editing);
}

#[tokio::test]
async fn test_close_releases_claim_permanently() {
    let store = MemStore::new();
    store.write_thread(1, "a", "sub", Default::default()).await;
    store.write_post(sample_post(2, 1, "a", "abc"), None).await;

    assert!(store.claim_post(2).await.unwrap());
    store
        .close_post(ClosePost {
            id: 2,
            op: 1,
            body: "abc".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Closed posts can never be claimed again
    assert!(!store.claim_post(2).await.unwrap());
}

#[tokio::test]
async fn test_counters_are_monotonic_per_view() {
    let store = MemStore::new();
    store.write_thread(1, "a", "sub", Default::default()).await;
    store.write_post(sample_post(2, 1, "a", ""), None).await;

    let mut thread_last = store.thread_counter(1).await.unwrap();
    let mut board_last = store.board_counter("a").await.unwrap();
    let mut all_last = store.all_board_counter().await.unwrap();

    for body in ["a", "ab", "abc"] {
        store.set_open_body(2, body).await.unwrap();

        let thread = store.thread_counter(1).await.unwrap();
        let board = store.board_counter("a").await.unwrap();
        let all = store.all_board_counter().await.unwrap();
        assert!(thread > thread_last);
        assert!(board > board_last);
        assert!(all > all_last);
        thread_last = thread;
        board_last = board;
        all_last = all;
    }
}

#[tokio::test]
async fn test_create_thread_then_reply() {
    let store = MemStore::new();
    store
        .create_board(&kagami::shared::BoardConfig {
            id: "a".to_string(),
            title: "Animu & Mango".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // A fresh board starts empty and gets its first thread through the
    // store contract alone
    assert!(store.board_snapshot("a", 0).await.unwrap().threads.is_empty());
    let thread = store
        .create_thread("first", &sample_post(0, 0, "a", "hello"), "hash")
        .await
        .unwrap();

    let reply = store
        .insert_post(&sample_post(0, thread, "a", "reply"), "hash")
        .await
        .unwrap();
    assert_eq!(reply, thread + 1);

    let board = store.board_snapshot("a", 0).await.unwrap();
    assert_eq!(board.threads.len(), 1);
    assert_eq!(board.threads[0].subject, "first");
    assert_eq!(board.threads[0].post_count, 2);
    assert_eq!(board.threads[0].posts.len(), 1);
    assert_eq!(board.threads[0].posts[0].body, "reply");
}

#[tokio::test]
async fn test_board_snapshot_orders_by_bump_time() {
    let store = MemStore::new();
    store.write_thread(1, "a", "first", Default::default()).await;
    store.write_thread(5, "a", "second", Default::default()).await;

    // A reply bumps the older thread above the newer one
    store.write_post(sample_post(2, 1, "a", ""), None).await;
    store
        .insert_post(&sample_post(0, 1, "a", "bump"), "hash")
        .await
        .unwrap();

    let board = store.board_snapshot("a", 0).await.unwrap();
    assert_eq!(board.threads[0].subject, "first");
    assert_eq!(board.threads[1].subject, "second");
}
