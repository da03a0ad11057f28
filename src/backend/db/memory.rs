//! In-Memory Store
//!
//! Implementation of the [`Store`] contract backed by process memory.
//! Selected when no `DATABASE_URL` is configured, and used throughout
//! the test suites. Every composite operation is applied under a single
//! write lock, which gives it the same atomicity the Postgres
//! implementation gets from transactions.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::backend::db::{BanRecord, ClosePost, Result, Store};
use crate::backend::error::BackendError;
use crate::shared::post::{Board, Image, Post, StandalonePost, Thread};
use crate::shared::{BoardConfig, ProtocolError};

/// Threads per board index page
const PAGE_SIZE: usize = 15;
/// Replies shown per thread on a board index page
const ABBREV_POSTS: usize = 5;

#[derive(Debug, Clone)]
struct ThreadRow {
    board: String,
    subject: String,
    sticky: bool,
    locked: bool,
    post_count: u32,
    image_count: u32,
    update_time: i64,
    bump_time: i64,
    counter: u64,
    rcount: u64,
}

#[derive(Debug, Clone)]
struct PostRow {
    post: StandalonePost,
    password_hash: Option<String>,
    claimed: bool,
}

#[derive(Debug, Clone)]
struct SessionRow {
    token: String,
    expires: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    boards: HashMap<String, BoardConfig>,
    threads: BTreeMap<u64, ThreadRow>,
    posts: BTreeMap<u64, PostRow>,
    post_counter: u64,
    board_counters: HashMap<String, u64>,
    all_counter: u64,
    bans: Vec<BanRecord>,
    accounts: HashMap<String, String>,
    sessions: HashMap<String, Vec<SessionRow>>,
    captchas: HashMap<String, String>,
    solved_captchas: HashMap<IpAddr, DateTime<Utc>>,
    image_tokens: HashMap<String, String>,
    pyu: HashMap<String, u64>,
    listeners: HashMap<String, broadcast::Sender<String>>,
}

/// In-memory store. Cheap to construct; all state is dropped with it.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an image token, standing in for the imager issuing one
    /// after an upload
    pub async fn add_image_token(&self, token: &str, sha1: &str) {
        let mut inner = self.inner.write().await;
        inner
            .image_tokens
            .insert(token.to_string(), sha1.to_string());
    }

    /// Seed a captcha challenge, standing in for the captcha service
    pub async fn add_captcha(&self, id: &str, solution: &str) {
        let mut inner = self.inner.write().await;
        inner.captchas.insert(id.to_string(), solution.to_string());
    }

    /// Write a thread row directly. Test fixture.
    pub async fn write_thread(&self, id: u64, board: &str, subject: &str, op: Post) {
        let mut inner = self.inner.write().await;
        let now = Utc::now().timestamp();
        inner.threads.insert(
            id,
            ThreadRow {
                board: board.to_string(),
                subject: subject.to_string(),
                sticky: false,
                locked: false,
                post_count: 1,
                image_count: 0,
                update_time: now,
                bump_time: now,
                counter: 1,
                rcount: 0,
            },
        );
        inner.posts.insert(
            id,
            PostRow {
                post: StandalonePost {
                    post: op,
                    op: id,
                    board: board.to_string(),
                },
                password_hash: None,
                claimed: false,
            },
        );
        if inner.post_counter < id {
            inner.post_counter = id;
        }
    }

    /// Write a post row directly, with an optional bcrypt password
    /// hash. Test fixture.
    pub async fn write_post(&self, post: StandalonePost, password_hash: Option<String>) {
        let mut inner = self.inner.write().await;
        let id = post.post.id;
        inner.posts.insert(
            id,
            PostRow {
                post,
                password_hash,
                claimed: false,
            },
        );
        if inner.post_counter < id {
            inner.post_counter = id;
        }
    }

    /// Notify a change-feed channel
    pub async fn notify(&self, channel: &str, msg: &str) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.listeners.get(channel) {
            let _ = tx.send(msg.to_string());
        }
    }
}

impl Inner {
    fn bump(&mut self, thread: u64) {
        let board = match self.threads.get_mut(&thread) {
            Some(row) => {
                row.counter += 1;
                row.update_time = Utc::now().timestamp();
                row.board.clone()
            }
            None => return,
        };
        *self.board_counters.entry(board).or_insert(0) += 1;
        self.all_counter += 1;
    }

    fn thread_view(&self, id: u64, row: &ThreadRow, last: i64, catalog: bool) -> Thread {
        let op = self
            .posts
            .get(&id)
            .map(|r| r.post.post.clone())
            .unwrap_or_default();
        let mut replies: Vec<Post> = if catalog {
            Vec::new()
        } else {
            self.posts
                .values()
                .filter(|r| r.post.op == id && r.post.post.id != id)
                .map(|r| r.post.post.clone())
                .collect()
        };
        let mut abbrev = false;
        if last > 0 && replies.len() > last as usize {
            replies.drain(..replies.len() - last as usize);
            abbrev = true;
        }
        Thread {
            abbrev,
            sticky: row.sticky,
            locked: row.locked,
            post_count: row.post_count,
            image_count: row.image_count,
            update_time: row.update_time,
            bump_time: row.bump_time,
            subject: row.subject.clone(),
            board: row.board.clone(),
            post: op,
            posts: replies,
        }
    }

    /// Threads of a board, sticky first, then by descending bump time
    fn board_threads(&self, board: Option<&str>) -> Vec<(u64, &ThreadRow)> {
        let mut threads: Vec<(u64, &ThreadRow)> = self
            .threads
            .iter()
            .filter(|(_, row)| board.map(|b| row.board == b).unwrap_or(true))
            .map(|(id, row)| (*id, row))
            .collect();
        threads.sort_by(|a, b| {
            b.1.sticky
                .cmp(&a.1.sticky)
                .then(b.1.bump_time.cmp(&a.1.bump_time))
        });
        threads
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_board(&self, config: &BoardConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.boards.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn all_board_configs(&self) -> Result<Vec<BoardConfig>> {
        let inner = self.inner.read().await;
        let mut configs: Vec<BoardConfig> = inner.boards.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    async fn validate_op(&self, id: u64, board: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .threads
            .get(&id)
            .map(|row| row.board == board)
            .unwrap_or(false))
    }

    async fn create_thread(
        &self,
        subject: &str,
        post: &StandalonePost,
        password_hash: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if !inner.boards.contains_key(&post.board) {
            return Err(BackendError::Store(sqlx::Error::RowNotFound));
        }
        inner.post_counter += 1;
        let id = inner.post_counter;
        let now = Utc::now().timestamp();

        inner.threads.insert(
            id,
            ThreadRow {
                board: post.board.clone(),
                subject: subject.to_string(),
                sticky: false,
                locked: false,
                post_count: 1,
                image_count: 0,
                update_time: now,
                bump_time: now,
                counter: 0,
                rcount: 0,
            },
        );

        let mut stored = post.clone();
        stored.post.id = id;
        stored.post.editing = true;
        stored.op = id;
        inner.posts.insert(
            id,
            PostRow {
                post: stored,
                password_hash: Some(password_hash.to_string()),
                claimed: true,
            },
        );
        inner.bump(id);
        Ok(id)
    }

    async fn insert_post(&self, post: &StandalonePost, password_hash: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.post_counter += 1;
        let id = inner.post_counter;

        let mut stored = post.clone();
        stored.post.id = id;
        stored.post.editing = true;
        inner.posts.insert(
            id,
            PostRow {
                post: stored,
                password_hash: Some(password_hash.to_string()),
                claimed: true,
            },
        );

        if let Some(row) = inner.threads.get_mut(&post.op) {
            row.post_count += 1;
            if !post.post.sage && row.post_count <= crate::shared::config::BUMP_LIMIT {
                row.bump_time = Utc::now().timestamp();
            }
        }
        inner.bump(post.op);
        Ok(id)
    }

    async fn set_open_body(&self, id: u64, body: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let op = match inner.posts.get_mut(&id) {
            Some(row) => {
                row.post.post.body = body.to_string();
                row.post.op
            }
            None => return Err(BackendError::Store(sqlx::Error::RowNotFound)),
        };
        inner.bump(op);
        Ok(())
    }

    async fn close_post(&self, params: ClosePost) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.posts.get_mut(&params.id) {
            Some(row) => {
                row.post.post.editing = false;
                row.post.post.body = params.body;
                row.post.post.links = params.links;
                row.post.post.commands = params.commands;
                row.claimed = false;
            }
            None => return Err(BackendError::Store(sqlx::Error::RowNotFound)),
        }
        if let Some(loss) = params.roulette_loss {
            inner.bans.push(BanRecord {
                board: loss.board,
                ip: loss.ip,
                expires: Utc::now() + Duration::hours(1),
                reason: "lost at #roulette".to_string(),
                by: "system".to_string(),
                for_post: params.id,
            });
            if let Some(row) = inner.threads.get_mut(&params.op) {
                row.rcount += 1;
            }
        }
        inner.bump(params.op);
        Ok(())
    }

    async fn insert_image(
        &self,
        id: u64,
        token: &str,
        name: &str,
        spoiler: bool,
    ) -> Result<Image> {
        let mut inner = self.inner.write().await;
        let sha1 = inner
            .image_tokens
            .remove(token)
            .ok_or(ProtocolError::invalid_payload("unknown image token"))?;
        let image = Image {
            name: name.to_string(),
            sha1,
            spoiler,
        };
        let op = match inner.posts.get_mut(&id) {
            Some(row) => {
                row.post.post.image = Some(image.clone());
                row.post.op
            }
            None => return Err(BackendError::Store(sqlx::Error::RowNotFound)),
        };
        if let Some(row) = inner.threads.get_mut(&op) {
            row.image_count += 1;
        }
        inner.bump(op);
        Ok(image)
    }

    async fn spoiler_image(&self, id: u64, op: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.posts.get_mut(&id).and_then(|r| r.post.post.image.as_mut()) {
            Some(image) => image.spoiler = true,
            None => return Err(BackendError::Store(sqlx::Error::RowNotFound)),
        }
        inner.bump(op);
        Ok(())
    }

    async fn get_post(&self, id: u64) -> Result<Option<StandalonePost>> {
        let inner = self.inner.read().await;
        Ok(inner.posts.get(&id).map(|row| row.post.clone()))
    }

    async fn get_post_password(&self, id: u64) -> Result<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner.posts.get(&id).and_then(|row| row.password_hash.clone()))
    }

    async fn claim_post(&self, id: u64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.posts.get_mut(&id) {
            Some(row) if row.post.post.editing && !row.claimed => {
                row.claimed = true;
                true
            }
            _ => false,
        })
    }

    async fn release_post(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.posts.get_mut(&id) {
            row.claimed = false;
        }
        Ok(())
    }

    async fn thread_counter(&self, id: u64) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.threads.get(&id).map(|row| row.counter).unwrap_or(0))
    }

    async fn board_counter(&self, board: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.board_counters.get(board).copied().unwrap_or(0))
    }

    async fn all_board_counter(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.all_counter)
    }

    async fn increment_rcount(&self, thread: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.threads.get_mut(&thread) {
            row.rcount += 1;
        }
        Ok(())
    }

    async fn rcount(&self, thread: u64) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.threads.get(&thread).map(|row| row.rcount).unwrap_or(0))
    }

    async fn set_post_counter(&self, n: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.post_counter = n;
        Ok(())
    }

    async fn pyu_increment(&self, board: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let counter = inner.pyu.entry(board.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn pyu_count(&self, board: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.pyu.get(board).copied().unwrap_or(0))
    }

    async fn thread_snapshot(&self, id: u64, last: i64) -> Result<Option<Thread>> {
        let inner = self.inner.read().await;
        Ok(inner
            .threads
            .get(&id)
            .map(|row| inner.thread_view(id, row, last, false)))
    }

    async fn board_snapshot(&self, board: &str, page: i64) -> Result<Board> {
        let inner = self.inner.read().await;
        let threads = inner.board_threads(Some(board));
        let pages = (threads.len().max(1) + PAGE_SIZE - 1) / PAGE_SIZE;
        let page = page.max(0) as usize;
        let selected = threads
            .into_iter()
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .map(|(id, row)| inner.thread_view(id, row, ABBREV_POSTS as i64, false))
            .collect();
        Ok(Board {
            pages: pages as u32,
            threads: selected,
        })
    }

    async fn catalog_snapshot(&self, board: &str) -> Result<Board> {
        let inner = self.inner.read().await;
        let threads = inner
            .board_threads(Some(board))
            .into_iter()
            .map(|(id, row)| inner.thread_view(id, row, 0, true))
            .collect();
        Ok(Board { pages: 1, threads })
    }

    async fn all_catalog_snapshot(&self) -> Result<Board> {
        let inner = self.inner.read().await;
        let threads = inner
            .board_threads(None)
            .into_iter()
            .map(|(id, row)| inner.thread_view(id, row, 0, true))
            .collect();
        Ok(Board { pages: 1, threads })
    }

    async fn is_banned(&self, board: &str, ip: IpAddr) -> Result<Option<BanRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .bans
            .iter()
            .find(|ban| {
                ban.ip == ip && ban.active() && (ban.board == board || ban.board == "all")
            })
            .cloned())
    }

    async fn ban(
        &self,
        board: &str,
        reason: &str,
        by: &str,
        duration: Duration,
        ip: IpAddr,
        for_post: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.bans.push(BanRecord {
            board: board.to_string(),
            ip,
            expires: Utc::now() + duration,
            reason: reason.to_string(),
            by: by.to_string(),
            for_post,
        });
        Ok(())
    }

    async fn validate_captcha(&self, id: &str, solution: &str, ip: IpAddr) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let valid = inner
            .captchas
            .get(id)
            .map(|expected| expected == solution)
            .unwrap_or(false);
        if valid {
            inner.captchas.remove(id);
            inner.solved_captchas.insert(ip, Utc::now());
        }
        Ok(valid)
    }

    async fn solved_captcha_recently(&self, ip: IpAddr, window: Duration) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .solved_captchas
            .get(&ip)
            .map(|at| *at + window > Utc::now())
            .unwrap_or(false))
    }

    async fn register_account(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.accounts.contains_key(user_id) {
            return Err(ProtocolError::AccessDenied("login ID already taken".to_string()).into());
        }
        inner
            .accounts
            .insert(user_id.to_string(), password_hash.to_string());
        Ok(())
    }

    async fn get_password(&self, user_id: &str) -> Result<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner.accounts.get(user_id).cloned())
    }

    async fn change_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.accounts.get_mut(user_id) {
            Some(hash) => {
                *hash = password_hash.to_string();
                Ok(())
            }
            None => Err(BackendError::Store(sqlx::Error::RowNotFound)),
        }
    }

    async fn write_login_session(
        &self,
        user_id: &str,
        token: &str,
        expiry: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .entry(user_id.to_string())
            .or_default()
            .push(SessionRow {
                token: token.to_string(),
                expires: Utc::now() + expiry,
            });
        Ok(())
    }

    async fn is_logged_in(&self, user_id: &str, token: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .any(|row| row.token == token && row.expires > Utc::now())
            })
            .unwrap_or(false))
    }

    async fn log_out(&self, user_id: &str, token: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(rows) = inner.sessions.get_mut(user_id) {
            rows.retain(|row| row.token != token);
        }
        Ok(())
    }

    async fn log_out_all(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(user_id);
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut inner = self.inner.write().await;
        let tx = inner
            .listeners
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone();
        drop(inner);

        let (out_tx, out_rx) = mpsc::channel(64);
        let mut rx = tx.subscribe();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if out_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_post(id: u64, op: u64, board: &str, body: &str) -> StandalonePost {
        StandalonePost {
            post: Post {
                id,
                editing: true,
                time: Utc::now().timestamp(),
                body: body.to_string(),
                ..Default::default()
            },
            op,
            board: board.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_thread_allocates_op() {
        let store = MemStore::new();
        store
            .create_board(&crate::shared::BoardConfig {
                id: "a".to_string(),
                title: "Animu & Mango".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let id = store
            .create_thread("first", &sample_post(0, 0, "a", "hi"), "hash")
            .await
            .unwrap();
        assert_ne!(id, 0);
        assert!(store.validate_op(id, "a").await.unwrap());

        // The OP is its own thread, open and claimed by its author
        let op = store.get_post(id).await.unwrap().unwrap();
        assert_eq!(op.op, id);
        assert!(op.post.editing);
        assert!(!store.claim_post(id).await.unwrap());

        let thread = store.thread_snapshot(id, 0).await.unwrap().unwrap();
        assert_eq!(thread.subject, "first");
        assert_eq!(thread.post_count, 1);
        assert!(store.thread_counter(id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_create_thread_requires_board() {
        let store = MemStore::new();
        assert!(store
            .create_thread("first", &sample_post(0, 0, "z", "hi"), "hash")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_insert_post_allocates_sequential_ids() {
        let store = MemStore::new();
        store.write_thread(1, "a", "sub", Post::default()).await;

        let first = store
            .insert_post(&sample_post(0, 1, "a", ""), "hash")
            .await
            .unwrap();
        let second = store
            .insert_post(&sample_post(0, 1, "a", ""), "hash")
            .await
            .unwrap();
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_claim_post_is_exclusive() {
        let store = MemStore::new();
        store
            .write_post(sample_post(2, 1, "a", "abc"), None)
            .await;

        assert!(store.claim_post(2).await.unwrap());
        assert!(!store.claim_post(2).await.unwrap());

        store.release_post(2).await.unwrap();
        assert!(store.claim_post(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_post_applies_roulette_loss() {
        let store = MemStore::new();
        store.write_thread(1, "a", "sub", Post::default()).await;
        store
            .write_post(sample_post(2, 1, "a", "#roulette"), None)
            .await;

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        store
            .close_post(ClosePost {
                id: 2,
                op: 1,
                body: "#roulette".to_string(),
                commands: vec![crate::shared::Command::Roulette([1, 6])],
                roulette_loss: Some(crate::backend::db::RouletteLoss {
                    board: "a".to_string(),
                    ip,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let ban = store.is_banned("a", ip).await.unwrap().unwrap();
        assert_eq!(ban.reason, "lost at #roulette");
        assert_eq!(store.rcount(1).await.unwrap(), 1);

        let post = store.get_post(2).await.unwrap().unwrap();
        assert!(!post.post.editing);
    }

    #[tokio::test]
    async fn test_thread_counter_bumps_on_body_write() {
        let store = MemStore::new();
        store.write_thread(1, "a", "sub", Post::default()).await;
        store
            .write_post(sample_post(2, 1, "a", "ab"), None)
            .await;

        let before = store.thread_counter(1).await.unwrap();
        store.set_open_body(2, "abc").await.unwrap();
        assert_eq!(store.thread_counter(1).await.unwrap(), before + 1);
    }

    #[tokio::test]
    async fn test_listen_delivers_notifications() {
        let store = MemStore::new();
        let mut rx = store.listen("post_moderated").await.unwrap();
        store.notify("post_moderated", "a,2").await;
        assert_eq!(rx.recv().await.unwrap(), "a,2");
    }

    #[tokio::test]
    async fn test_login_session_round_trip() {
        let store = MemStore::new();
        store.register_account("admin", "hash").await.unwrap();
        store
            .write_login_session("admin", "token", Duration::days(30))
            .await
            .unwrap();

        assert!(store.is_logged_in("admin", "token").await.unwrap());
        store.log_out("admin", "token").await.unwrap();
        assert!(!store.is_logged_in("admin", "token").await.unwrap());
    }
}
