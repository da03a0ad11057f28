//! Post Update Handlers
//!
//! The open-post state machine transitions driven by client commands:
//! allocation, append, backspace, splice, image insertion, spoilering
//! and close. Guard failures reject the current command and leave the
//! session open; every accepted mutation is mirrored to the feed and
//! persisted before the command completes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::db::{with_retry, ClosePost, RouletteLoss};
use crate::backend::error::BackendError;
use crate::backend::parser::commands::is_roulette_loss;
use crate::backend::parser::check_printable_str;
use crate::backend::websocket::client::Client;
use crate::backend::websocket::handlers::decode_payload;
use crate::backend::websocket::open_post::OpenPost;
use crate::shared::config::{
    MAX_LEN_BODY, MAX_LEN_NAME, MAX_LEN_POST_PASSWORD, MAX_LEN_SUBJECT, MAX_LINES_BODY,
};
use crate::shared::message::{encode, MessageType};
use crate::shared::post::{Command, Image, Link, Post, StandalonePost};
use crate::shared::ProtocolError;

/// Open posts older than this are closed on the next mutation attempt
const POST_OPEN_LIMIT_SECS: i64 = 29 * 60;

#[derive(Debug, Deserialize)]
pub struct SpliceRequest {
    pub start: u64,
    pub len: u64,
    pub text: String,
}

/// Splice broadcast sent to all listening clients
#[derive(Debug, Serialize)]
struct SpliceMessage {
    id: u64,
    start: u64,
    len: i64,
    text: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub spoiler: bool,
}

#[derive(Debug, Serialize)]
struct ImageMessage {
    id: u64,
    image: Image,
}

#[derive(Debug, Serialize)]
struct ClosePostMessage {
    id: u64,
    links: Vec<Link>,
    commands: Vec<Command>,
}

#[derive(Debug, Deserialize)]
pub struct PostCreationRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sage: bool,
    pub password: String,
    #[serde(default)]
    pub body: String,
    /// Thread subject. Required when the client is synced to a board
    /// and the post opens a new thread.
    #[serde(default)]
    pub subject: String,
}

impl Client {
    /// Whether the client has a usable open post. A post older than 29
    /// minutes is closed here and the triggering mutation is dropped.
    async fn has_post(&mut self) -> Result<bool, BackendError> {
        if self.post.id == 0 {
            return Err(ProtocolError::NoPostOpen.into());
        }
        if self.post.time < Utc::now().timestamp() - POST_OPEN_LIMIT_SECS {
            self.close_post().await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Mirror the mutated body to the feed, charge the spam score and
    /// persist. `chars` is the number of characters the mutation
    /// touched.
    async fn update_body(&mut self, frame: String, chars: usize) -> Result<(), BackendError> {
        if let Some(feed) = &self.feed {
            feed.set_open_body(self.post.id, &self.post.body, frame);
        }
        let score = chars as u64 * self.state.admission.spam_config().char_score;
        self.state
            .admission
            .increment_spam_score(self.handle.ip(), score);

        let store = self.state.store.clone();
        let id = self.post.id;
        let body = self.post.body.clone();
        with_retry(|| store.set_open_body(id, &body)).await
    }

    /// Append a rune to the body of the open post
    pub(crate) async fn append_rune(&mut self, data: &str) -> Result<(), BackendError> {
        if !self.has_post().await? {
            return Ok(());
        }
        self.state.admission.captcha_gate(self.handle.ip()).await?;

        let code: u32 = decode_payload(data)?;
        let r = char::from_u32(code)
            .ok_or_else(|| ProtocolError::invalid_payload(data))?;
        self.post.append(r)?;

        let frame = encode(MessageType::Append, &[self.post.id, code as u64])?;
        self.update_body(frame, 1).await
    }

    /// Remove one character from the end of the open post
    pub(crate) async fn backspace(&mut self) -> Result<(), BackendError> {
        if !self.has_post().await? {
            return Ok(());
        }
        self.state.admission.captcha_gate(self.handle.ip()).await?;

        self.post.backspace()?;
        let frame = encode(MessageType::Backspace, &self.post.id)?;
        self.update_body(frame, 1).await
    }

    /// Splice the text in the open post
    pub(crate) async fn splice_text(&mut self, data: &str) -> Result<(), BackendError> {
        if !self.has_post().await? {
            return Ok(());
        }
        self.state.admission.captcha_gate(self.handle.ip()).await?;

        let req: SpliceRequest = decode_payload(data)?;
        let effect = self.post.splice(req.start, req.len, &req.text)?;
        let message = SpliceMessage {
            id: self.post.id,
            start: effect.start,
            len: effect.len,
            text: effect.text,
        };
        let frame = encode(MessageType::Splice, &message)?;

        // +1 so zero-insert splices cannot be spammed for free
        let chars = message.text.chars().count() + 1;
        self.update_body(frame, chars).await
    }

    /// Insert an image into an existing open post
    pub(crate) async fn insert_image(&mut self, data: &str) -> Result<(), BackendError> {
        if !self.has_post().await? {
            return Err(ProtocolError::NoPostOpen.into());
        }
        if self.post.has_image {
            return Err(ProtocolError::HasImage.into());
        }
        let config = self
            .state
            .boards
            .get(&self.post.board)
            .ok_or_else(|| ProtocolError::InvalidBoard(self.post.board.clone()))?;
        if config.text_only {
            return Err(ProtocolError::TextOnly.into());
        }
        self.state.admission.captcha_gate(self.handle.ip()).await?;

        let mut req: ImageRequest = decode_payload(data)?;
        format_image_name(&mut req.name)?;

        let image = self
            .state
            .store
            .insert_image(self.post.id, &req.token, &req.name, req.spoiler)
            .await?;
        self.post.has_image = true;
        self.post.is_spoilered = req.spoiler;

        if let Some(feed) = &self.feed {
            let frame = encode(
                MessageType::InsertImage,
                &ImageMessage {
                    id: self.post.id,
                    image,
                },
            )?;
            feed.insert_image(self.post.id, frame);
        }
        self.handle.set_last_time();
        Ok(())
    }

    /// Spoiler an already inserted image in an unclosed post
    pub(crate) async fn spoiler_image(&mut self) -> Result<(), BackendError> {
        if !self.has_post().await? {
            return Err(ProtocolError::NoPostOpen.into());
        }
        if !self.post.has_image {
            return Err(ProtocolError::NoImage.into());
        }
        if self.post.is_spoilered {
            return Err(ProtocolError::AlreadySpoilered.into());
        }

        self.state
            .store
            .spoiler_image(self.post.id, self.post.op)
            .await?;
        self.post.is_spoilered = true;

        if let Some(feed) = &self.feed {
            let frame = encode(MessageType::Spoiler, &self.post.id)?;
            feed.spoiler_image(self.post.id, frame);
        }
        Ok(())
    }

    /// Close the open post: parse the final body, persist it together
    /// with any roulette loss, and clear the slot
    pub(crate) async fn close_post(&mut self) -> Result<(), BackendError> {
        if self.post.id == 0 {
            return Err(ProtocolError::NoPostOpen.into());
        }

        let (links, commands) = if self.post.len != 0 {
            self.state
                .parser
                .parse_body(
                    &self.post.body,
                    &self.post.board,
                    self.post.op,
                    self.post.id,
                    self.handle.ip(),
                    false,
                )
                .await?
        } else {
            (Vec::new(), Vec::new())
        };

        let roulette_loss = commands.iter().any(is_roulette_loss).then(|| RouletteLoss {
            board: self.post.board.clone(),
            ip: self.handle.ip(),
        });
        let params = ClosePost {
            id: self.post.id,
            op: self.post.op,
            body: self.post.body.clone(),
            links: links.clone(),
            commands: commands.clone(),
            roulette_loss,
        };
        let store = self.state.store.clone();
        with_retry(|| store.close_post(params.clone())).await?;

        if let Some(feed) = &self.feed {
            let frame = encode(
                MessageType::ClosePost,
                &ClosePostMessage {
                    id: self.post.id,
                    links,
                    commands,
                },
            )?;
            feed.close_post(self.post.id, frame);
        }

        self.post = OpenPost::default();
        Ok(())
    }

    /// Allocate a new post and open it for editing: a reply when the
    /// client is synced to a thread, a new thread with its OP when it
    /// is synced to a board
    pub(crate) async fn insert_post(&mut self, data: &str) -> Result<(), BackendError> {
        let req: PostCreationRequest = decode_payload(data)?;
        let (thread, board) = self
            .handle
            .sync_target()
            .ok_or_else(|| ProtocolError::invalid_payload("not synchronised"))?;

        if self.post.id != 0 {
            self.close_post().await?;
        }

        let config = self
            .state
            .boards
            .get(&board)
            .ok_or_else(|| ProtocolError::InvalidBoard(board.clone()))?;
        if config.locked {
            return Err(ProtocolError::AccessDenied("board is locked".to_string()).into());
        }
        self.state
            .admission
            .check_banned(&board, self.handle.ip())
            .await?;
        self.state.admission.captcha_gate(self.handle.ip()).await?;

        if req.name.chars().count() > MAX_LEN_NAME {
            return Err(ProtocolError::invalid_payload("name").into());
        }
        if req.password.is_empty() || req.password.len() > MAX_LEN_POST_PASSWORD {
            return Err(ProtocolError::invalid_payload("password").into());
        }
        if thread == 0
            && (req.subject.is_empty() || req.subject.chars().count() > MAX_LEN_SUBJECT)
        {
            return Err(ProtocolError::invalid_payload("subject").into());
        }
        let body_len = req.body.chars().count();
        if body_len > MAX_LEN_BODY {
            return Err(ProtocolError::BodyTooLong.into());
        }
        let lines = req.body.matches('\n').count();
        if lines > MAX_LINES_BODY {
            return Err(ProtocolError::TooManyLines.into());
        }
        check_printable_str(&req.body, true)?;

        let password_hash = bcrypt::hash(&req.password, 10)?;
        let now = Utc::now().timestamp();
        let mut post = StandalonePost {
            post: Post {
                editing: true,
                sage: req.sage,
                time: now,
                name: req.name,
                body: req.body,
                ..Default::default()
            },
            op: thread,
            board: board.clone(),
        };

        let id = if thread == 0 {
            let id = self
                .state
                .store
                .create_thread(&req.subject, &post, &password_hash)
                .await?;
            post.op = id;
            // The creator moves from the board feed into the new
            // thread's feed before anything is broadcast on it
            let feed = self.state.feeds.sync_client(&self.handle, id, &board);
            self.feed = Some(feed);
            id
        } else {
            self.state.store.insert_post(&post, &password_hash).await?
        };
        post.post.id = id;

        self.post = OpenPost {
            id,
            op: post.op,
            board,
            len: body_len,
            lines,
            time: now,
            body: post.post.body.clone(),
            ..Default::default()
        };
        self.state.admission.increment_spam_score(
            self.handle.ip(),
            self.state.admission.spam_config().post_creation_score,
        );

        if let Some(feed) = &self.feed {
            let frame = encode(MessageType::InsertPost, &post.post)?;
            feed.insert_post(&post.post, frame);
        }
        self.handle.set_last_time();
        self.send_message(MessageType::PostId, &id)
    }
}

/// Sanitize a client-supplied image file name
fn format_image_name(name: &mut String) -> Result<(), ProtocolError> {
    if name.is_empty() || name.len() > 200 {
        return Err(ProtocolError::invalid_payload("image name"));
    }
    check_printable_str(name, false)?;
    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::invalid_payload("image name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::backend::db::{MemStore, Result as DbResult, Store};
    use crate::backend::parser::BodyParser;
    use crate::backend::test_support::{state_with_parser, test_client, test_state};
    use crate::backend::websocket::client::{Client, ClientChannels};

    #[test]
    fn test_image_name_sanitised() {
        let mut ok = "foo.jpeg".to_string();
        assert!(format_image_name(&mut ok).is_ok());

        for bad in ["", "a/b.png", "a\\b.png", "a\0.png"] {
            let mut name = bad.to_string();
            assert!(format_image_name(&mut name).is_err(), "accepted {:?}", bad);
        }
    }

    fn sample_open_post(body: &str) -> OpenPost {
        OpenPost {
            id: 2,
            op: 1,
            board: "a".to_string(),
            body: body.to_string(),
            len: body.chars().count(),
            lines: body.matches('\n').count(),
            time: Utc::now().timestamp(),
            ..Default::default()
        }
    }

    async fn seed_thread_and_post(store: &MemStore, body: &str) {
        store.write_thread(1, "a", "sub", Post::default()).await;
        store
            .write_post(
                StandalonePost {
                    post: Post {
                        id: 2,
                        editing: true,
                        time: Utc::now().timestamp(),
                        body: body.to_string(),
                        ..Default::default()
                    },
                    op: 1,
                    board: "a".to_string(),
                },
                None,
            )
            .await;
    }

    /// Sync the session to thread 1 and drain the catch-up frames so
    /// assertions start from a clean feed buffer
    async fn join_thread(client: &mut Client, channels: &mut ClientChannels) {
        let feed = client
            .state
            .feeds
            .sync_client(&client.handle, 1, "a");
        client.feed = Some(feed.clone());
        channels.send_rx.recv().await.unwrap();
        let _ = feed.flush();
    }

    #[tokio::test]
    async fn test_append_flow() {
        let (state, store) = test_state().await;
        seed_thread_and_post(&store, "abc").await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post("abc");

        client.append_rune("100").await.unwrap();

        assert_eq!(client.post.body, "abcd");
        assert_eq!(client.post.len, 4);
        assert_eq!(client.post.lines, 0);

        let feed = client.feed.as_ref().unwrap();
        assert_eq!(feed.flush().unwrap(), r#"33["03[2,100]"]"#);
        let stored = store.get_post(2).await.unwrap().unwrap();
        assert_eq!(stored.post.body, "abcd");
    }

    #[tokio::test]
    async fn test_append_body_too_long() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);
        client.post = sample_open_post(&"a".repeat(MAX_LEN_BODY));

        let err = client.append_rune("100").await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::BodyTooLong)
        ));
    }

    #[tokio::test]
    async fn test_backspace_flow() {
        let (state, store) = test_state().await;
        seed_thread_and_post(&store, "abc").await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post("abc");

        client.backspace().await.unwrap();

        assert_eq!(client.post.body, "ab");
        assert_eq!(client.post.len, 2);
        let stored = store.get_post(2).await.unwrap().unwrap();
        assert_eq!(stored.post.body, "ab");
    }

    #[tokio::test]
    async fn test_splice_truncation() {
        let long_text = "Never gonna give you up Never gonna let you down Never gonna run around and desert you ";
        let original = "a".repeat(MAX_LEN_BODY);

        let (state, store) = test_state().await;
        seed_thread_and_post(&store, &original).await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post(&original);

        let request = format!(
            r#"{{"start":1943,"len":0,"text":"{}"}}"#,
            long_text
        );
        client.splice_text(&request).await.unwrap();

        assert_eq!(client.post.len, MAX_LEN_BODY);
        let expected = format!("{}{}", &original[..1943], &long_text[..57]);
        assert_eq!(client.post.body, expected);

        let feed = client.feed.as_ref().unwrap();
        let flushed = feed.flush().unwrap();
        assert!(flushed.contains(r#"\"len\":-1"#));
        assert!(flushed.contains(&format!(r#"\"text\":\"{}\""#, &long_text[..57])));

        let stored = store.get_post(2).await.unwrap().unwrap();
        assert_eq!(stored.post.body, expected);
    }

    /// Parser stub resolving any body to a losing roulette roll
    struct LosingRoulette;

    #[async_trait]
    impl BodyParser for LosingRoulette {
        async fn parse_body(
            &self,
            _body: &str,
            _board: &str,
            _op: u64,
            _id: u64,
            _ip: IpAddr,
            _is_open: bool,
        ) -> DbResult<(Vec<Link>, Vec<Command>)> {
            Ok((Vec::new(), vec![Command::Roulette([1, 6])]))
        }
    }

    #[tokio::test]
    async fn test_close_with_roulette_loss() {
        let store = Arc::new(MemStore::new());
        let state = state_with_parser(store.clone(), Arc::new(LosingRoulette)).await;
        seed_thread_and_post(&store, "#roulette").await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post("#roulette");

        client.close_post().await.unwrap();
        assert_eq!(client.post, OpenPost::default());

        let stored = store.get_post(2).await.unwrap().unwrap();
        assert!(!stored.post.editing);
        assert_eq!(stored.post.commands, vec![Command::Roulette([1, 6])]);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let ban = store.is_banned("a", ip).await.unwrap().unwrap();
        assert_eq!(ban.reason, "lost at #roulette");
        assert!(ban.expires <= Utc::now() + chrono::Duration::hours(1));
        assert_eq!(store.rcount(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_empty_slot_rejected() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);

        let err = client.close_post().await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::NoPostOpen)
        ));
    }

    #[tokio::test]
    async fn test_old_open_post_auto_closes_once() {
        let (state, store) = test_state().await;
        seed_thread_and_post(&store, "abc").await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post("abc");
        client.post.time = Utc::now().timestamp() - 30 * 60;

        // The stale mutation is dropped and the post closed
        client.append_rune("100").await.unwrap();
        assert_eq!(client.post, OpenPost::default());
        let stored = store.get_post(2).await.unwrap().unwrap();
        assert!(!stored.post.editing);
        assert_eq!(stored.post.body, "abc");

        // Any further mutation reports no open post
        let err = client.append_rune("100").await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::NoPostOpen)
        ));
    }

    #[tokio::test]
    async fn test_insert_image_guards() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);
        client.post = sample_open_post("");
        client.post.has_image = true;

        let err = client.insert_image("{}").await.unwrap_err();
        assert!(matches!(err.as_protocol(), Some(ProtocolError::HasImage)));
    }

    #[tokio::test]
    async fn test_insert_image_on_text_only_board() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);
        client.post = sample_open_post("");
        client.post.board = "t".to_string();

        let err = client
            .insert_image(r#"{"token":"123","name":"foo.jpeg"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err.as_protocol(), Some(ProtocolError::TextOnly)));
    }

    #[tokio::test]
    async fn test_insert_image_flow() {
        let (state, store) = test_state().await;
        seed_thread_and_post(&store, "").await;
        store.add_image_token("tok", "da39a3ee").await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;
        client.post = sample_open_post("");

        client
            .insert_image(r#"{"token":"tok","name":"foo.jpeg"}"#)
            .await
            .unwrap();
        assert!(client.post.has_image);

        let stored = store.get_post(2).await.unwrap().unwrap();
        assert_eq!(stored.post.image.as_ref().unwrap().name, "foo.jpeg");

        // Spoiler it afterwards
        client.spoiler_image().await.unwrap();
        assert!(client.post.is_spoilered);
        let stored = store.get_post(2).await.unwrap().unwrap();
        assert!(stored.post.image.unwrap().spoiler);

        let err = client.spoiler_image().await.unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolError::AlreadySpoilered)
        ));
    }

    #[tokio::test]
    async fn test_insert_post_allocates_and_acks() {
        let (state, store) = test_state().await;
        store.write_thread(1, "a", "sub", Post::default()).await;
        let (mut client, mut channels) = test_client(&state);
        join_thread(&mut client, &mut channels).await;

        client
            .insert_post(r#"{"password":"123","body":"hello"}"#)
            .await
            .unwrap();

        assert_ne!(client.post.id, 0);
        assert_eq!(client.post.body, "hello");
        assert_eq!(client.post.len, 5);

        // PostId ack to the creator
        let ack = channels.send_rx.recv().await.unwrap();
        assert_eq!(ack, format!("08{}", client.post.id));

        // InsertPost broadcast through the feed
        let feed = client.feed.as_ref().unwrap();
        let flushed = feed.flush().unwrap();
        assert!(flushed.contains(r#"01{"#));

        let stored = store.get_post(client.post.id).await.unwrap().unwrap();
        assert!(stored.post.editing);
        assert_eq!(stored.post.body, "hello");
    }

    #[tokio::test]
    async fn test_insert_post_creates_thread_from_board_sync() {
        let (state, store) = test_state().await;
        let (mut client, mut channels) = test_client(&state);
        state.feeds.sync_client(&client.handle, 0, "a");

        client
            .insert_post(r#"{"password":"123","subject":"first","body":"hi"}"#)
            .await
            .unwrap();

        // The OP opens its own thread
        let id = client.post.id;
        assert_ne!(id, 0);
        assert_eq!(client.post.op, id);
        assert!(store.validate_op(id, "a").await.unwrap());

        // The creator now rides the new thread's feed
        assert_eq!(
            state.feeds.get_sync(&client.handle),
            Some((id, "a".to_string()))
        );
        let feed = client.feed.as_ref().unwrap();
        let flushed = feed.flush().unwrap();
        assert!(flushed.contains(r#"01{"#));

        // Thread-feed catch-up, then the PostId ack
        let catch_up = channels.send_rx.recv().await.unwrap();
        assert!(catch_up.starts_with("33["));
        let ack = channels.send_rx.recv().await.unwrap();
        assert_eq!(ack, format!("08{}", id));

        let thread = store.thread_snapshot(id, 0).await.unwrap().unwrap();
        assert_eq!(thread.subject, "first");
        assert_eq!(thread.post.body, "hi");
        assert!(thread.post.editing);
    }

    #[tokio::test]
    async fn test_insert_post_on_board_requires_subject() {
        let (state, store) = test_state().await;
        let (mut client, _channels) = test_client(&state);
        state.feeds.sync_client(&client.handle, 0, "a");

        assert!(client
            .insert_post(r#"{"password":"123","body":"hi"}"#)
            .await
            .is_err());
        assert_eq!(client.post.id, 0);
        assert!(store.get_post(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_post_requires_sync() {
        let (state, _store) = test_state().await;
        let (mut client, _channels) = test_client(&state);

        assert!(client
            .insert_post(r#"{"password":"123"}"#)
            .await
            .is_err());
    }
}
