//! Synchronisation Handlers
//!
//! Joining a client to a board or thread feed, and reclaiming a
//! disconnected open post. Synchronisation serves the target's current
//! snapshot from the cache; reclaim transfers post ownership with an
//! atomic claim so two clients can never edit the same post.

use serde::Deserialize;

use crate::backend::cache::Key;
use crate::backend::error::BackendError;
use crate::backend::websocket::client::Client;
use crate::backend::websocket::handlers::decode_payload;
use crate::backend::websocket::open_post::OpenPost;
use crate::shared::config::PROTOCOL_VERSION;
use crate::shared::message::{encode, prepend_type, MessageType};
use crate::shared::ProtocolError;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    /// Request only the last 100 posts of the thread
    pub last_100: bool,
    pub catalog: bool,
    pub page: i64,
    pub protocol_version: u32,
    pub thread: u64,
    pub board: String,
}

#[derive(Debug, Deserialize)]
pub struct ReclaimRequest {
    pub id: u64,
    pub password: String,
}

impl Client {
    /// Synchronise the client to a board or thread and prepare it to
    /// receive update messages
    pub(crate) async fn synchronise(&mut self, data: &str) -> Result<(), BackendError> {
        let req: SyncRequest = decode_payload(data)?;
        if !self.state.boards.is_board(&req.board) {
            return Err(ProtocolError::InvalidBoard(req.board).into());
        }
        if req.thread != 0 && !self.state.store.validate_op(req.thread, &req.board).await? {
            return Err(ProtocolError::InvalidThread {
                id: req.thread,
                board: req.board,
            }
            .into());
        }
        self.state
            .admission
            .check_banned(&req.board, self.handle.ip())
            .await?;

        if req.protocol_version == PROTOCOL_VERSION {
            if let Some(config) = self.state.boards.get(&req.board) {
                self.send_message(MessageType::Configs, &config)?;
            }
        }
        self.register_sync(req).await
    }

    /// Register a fresh sync or switch from a previous one
    pub(crate) async fn register_sync(&mut self, req: SyncRequest) -> Result<(), BackendError> {
        if self.post.id != 0 {
            self.close_post().await?;
        }

        let feed = self
            .state
            .feeds
            .sync_client(&self.handle, req.thread, &req.board);
        self.feed = Some(feed);

        if req.protocol_version != PROTOCOL_VERSION {
            return self.send_message(MessageType::Synchronise, &());
        }

        // Send the target's current snapshot over the socket
        let frontends = &self.state.frontends;
        let (key, frontend) = if req.thread != 0 {
            let last = if req.last_100 { 100 } else { 0 };
            (Key::thread(req.thread, last), &frontends.thread)
        } else if req.catalog {
            (Key::catalog(&req.board), &frontends.catalog)
        } else {
            (
                Key::board_page(&req.board, req.page, true),
                &frontends.board_page,
            )
        };
        let (json, _, _) = self.state.cache.get_json(key, frontend).await?;
        self.handle.send(prepend_type(
            MessageType::Synchronise,
            &String::from_utf8_lossy(&json),
        ));
        Ok(())
    }

    /// Reclaim an open post after connection loss or navigating away.
    ///
    /// Ownership is transferred with an atomic claim in the store; a
    /// concurrent reclaim of the same post gets the rejection code.
    pub(crate) async fn reclaim_post(&mut self, data: &str) -> Result<(), BackendError> {
        if self.post.id != 0 {
            self.close_post().await?;
        }

        let req: ReclaimRequest = decode_payload(data)?;
        let hash = match self.state.store.get_post_password(req.id).await? {
            Some(hash) => hash,
            None => return self.send_reclaim_result(1),
        };
        if !bcrypt::verify(&req.password, &hash)? {
            return self.send_reclaim_result(1);
        }

        let post = match self.state.store.get_post(req.id).await? {
            Some(post) if post.post.editing => post,
            _ => return self.send_reclaim_result(1),
        };
        if !self.state.store.claim_post(req.id).await? {
            return self.send_reclaim_result(1);
        }

        self.post = OpenPost::init(&post);
        if let Some(feed) = &self.feed {
            let frame = encode(MessageType::InsertPost, &post.post)?;
            feed.insert_post(&post.post, frame);
        }
        self.handle.set_last_time();
        self.send_reclaim_result(0)
    }

    fn send_reclaim_result(&self, code: u8) -> Result<(), BackendError> {
        self.handle
            .send(prepend_type(MessageType::Reclaim, &code.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::backend::test_support::{test_client, test_state};
    use crate::shared::post::{Post, StandalonePost};

    fn sync_frame(thread: u64, board: &str) -> String {
        format!(
            r#"{{"thread":{},"board":"{}","protocol_version":{}}}"#,
            thread, board, PROTOCOL_VERSION
        )
    }

    #[tokio::test]
    async fn test_sync_to_invalid_board() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);

        let err = client.synchronise(&sync_frame(0, "z")).await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::InvalidBoard(board)) if board == "z"
        ));
    }

    #[tokio::test]
    async fn test_sync_to_invalid_thread() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);

        let err = client.synchronise(&sync_frame(1, "a")).await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::InvalidThread { id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_to_board() {
        let (state, _store) = test_state().await;
        let (mut client, mut channels) = test_client(&state);

        // Old protocol version gets a bare acknowledgement
        client
            .synchronise(r#"{"thread":0,"board":"a"}"#)
            .await
            .unwrap();
        assert_eq!(channels.send_rx.recv().await.unwrap(), "30null");
        assert_eq!(
            state.feeds.get_sync(&client.handle),
            Some((0, "a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_sync_to_thread_sends_snapshot() {
        let (state, store) = test_state().await;
        store.write_thread(1, "a", "sub", Post::default()).await;
        let (mut client, mut channels) = test_client(&state);

        client.synchronise(&sync_frame(1, "a")).await.unwrap();

        // Configs, then the catch-up concat, then the thread snapshot
        let configs = channels.send_rx.recv().await.unwrap();
        assert!(configs.starts_with("32{"));
        let catch_up = channels.send_rx.recv().await.unwrap();
        assert_eq!(catch_up, r#"33["35{\"active\":0,\"total\":1}"]"#);
        let snapshot = channels.send_rx.recv().await.unwrap();
        assert!(snapshot.starts_with("30{"));
        assert!(snapshot.contains(r#""subject":"sub""#));
        assert_eq!(
            state.feeds.get_sync(&client.handle),
            Some((1, "a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_switching_sync_leaves_old_feed() {
        let (state, store) = test_state().await;
        store.write_thread(1, "a", "sub", Post::default()).await;
        let (mut client, _channels) = test_client(&state);

        client.synchronise(&sync_frame(1, "a")).await.unwrap();
        assert!(state.feeds.feed_for_thread(1).is_some());

        client
            .synchronise(r#"{"thread":0,"board":"a"}"#)
            .await
            .unwrap();
        assert!(state.feeds.feed_for_thread(1).is_none());
    }

    async fn seed_editable_post(store: &crate::backend::db::MemStore, password: &str) {
        store.write_thread(1, "a", "sub", Post::default()).await;
        let hash = bcrypt::hash(password, 4).unwrap();
        store
            .write_post(
                StandalonePost {
                    post: Post {
                        id: 2,
                        editing: true,
                        time: Utc::now().timestamp(),
                        body: "abc".to_string(),
                        ..Default::default()
                    },
                    op: 1,
                    board: "a".to_string(),
                },
                Some(hash),
            )
            .await;
    }

    #[tokio::test]
    async fn test_reclaim_wrong_password() {
        let (state, store) = test_state().await;
        seed_editable_post(&store, "123").await;
        let (mut client, mut channels) = test_client(&state);

        client
            .reclaim_post(r#"{"id":2,"password":"aaa"}"#)
            .await
            .unwrap();

        assert_eq!(channels.send_rx.recv().await.unwrap(), "311");
        assert_eq!(
            client.post,
            crate::backend::websocket::open_post::OpenPost::default()
        );
    }

    #[tokio::test]
    async fn test_reclaim_rehydrates_post() {
        let (state, store) = test_state().await;
        seed_editable_post(&store, "123").await;
        let (mut client, mut channels) = test_client(&state);

        client
            .reclaim_post(r#"{"id":2,"password":"123"}"#)
            .await
            .unwrap();

        assert_eq!(channels.send_rx.recv().await.unwrap(), "310");
        assert_eq!(client.post.id, 2);
        assert_eq!(client.post.body, "abc");
        assert_eq!(client.post.len, 3);
    }

    #[tokio::test]
    async fn test_concurrent_reclaim_rejected() {
        let (state, store) = test_state().await;
        seed_editable_post(&store, "123").await;

        let (mut first, mut first_channels) = test_client(&state);
        first
            .reclaim_post(r#"{"id":2,"password":"123"}"#)
            .await
            .unwrap();
        assert_eq!(first_channels.send_rx.recv().await.unwrap(), "310");

        // The post is claimed; a second reclaim with the right
        // password still gets the rejection code
        let (mut second, mut second_channels) = test_client(&state);
        second
            .reclaim_post(r#"{"id":2,"password":"123"}"#)
            .await
            .unwrap();
        assert_eq!(second_channels.send_rx.recv().await.unwrap(), "311");
        assert_eq!(second.post.id, 0);
    }

    #[tokio::test]
    async fn test_reclaim_closed_post_rejected() {
        let (state, store) = test_state().await;
        store.write_thread(1, "a", "sub", Post::default()).await;
        let hash = bcrypt::hash("123", 4).unwrap();
        store
            .write_post(
                StandalonePost {
                    post: Post {
                        id: 2,
                        editing: false,
                        time: Utc::now().timestamp(),
                        ..Default::default()
                    },
                    op: 1,
                    board: "a".to_string(),
                },
                Some(hash),
            )
            .await;

        let (mut client, mut channels) = test_client(&state);
        client
            .reclaim_post(r#"{"id":2,"password":"123"}"#)
            .await
            .unwrap();
        assert_eq!(channels.send_rx.recv().await.unwrap(), "311");
    }
}
