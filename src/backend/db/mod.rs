//! Store Adapter
//!
//! Persistence contract for posts, threads, bans, sessions and counters.
//! The update pipeline is written against the [`Store`] trait and the
//! concrete implementation is injected at startup: [`PgStore`] when a
//! `DATABASE_URL` is configured, [`MemStore`] otherwise and in tests.
//!
//! # Transactionality
//!
//! Operations that the pipeline requires to be atomic are exposed as
//! composite methods (`close_post`, `claim_post`) and each
//! implementation guarantees commit-or-rollback internally:
//! `PgStore` through SQL transactions, `MemStore` by applying the whole
//! operation under a single write lock. `PgStore` additionally exposes
//! an inherent `in_transaction` helper for scoped transaction use.

pub mod memory;
pub mod pg;

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::error::BackendError;
use crate::shared::post::{Board, Command, Image, Link, StandalonePost, Thread};
use crate::shared::BoardConfig;

pub use memory::MemStore;
pub use pg::PgStore;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Change-feed channel notified when a post is moderated
pub const CHANNEL_POST_MODERATED: &str = "post_moderated";
/// Change-feed channel notified when a thread is deleted
pub const CHANNEL_THREAD_DELETED: &str = "thread_deleted";

/// Record of a ban issued on a board. `board` is `"all"` for global
/// bans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub board: String,
    pub ip: IpAddr,
    pub expires: DateTime<Utc>,
    pub reason: String,
    pub by: String,
    pub for_post: u64,
}

/// A `#roulette` loss to be applied atomically with the closing of the
/// post that rolled it: a one-hour ban on the poster and an increment
/// of the thread's loss counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RouletteLoss {
    pub board: String,
    pub ip: IpAddr,
}

/// Parameters for finalising an open post
#[derive(Debug, Clone, Default)]
pub struct ClosePost {
    pub id: u64,
    pub op: u64,
    pub body: String,
    pub links: Vec<Link>,
    pub commands: Vec<Command>,
    pub roulette_loss: Option<RouletteLoss>,
}

/// Persistence contract required by the post-update pipeline
#[async_trait]
pub trait Store: Send + Sync {
    // Boards

    /// Idempotently register a board
    async fn create_board(&self, config: &BoardConfig) -> Result<()>;

    async fn all_board_configs(&self) -> Result<Vec<BoardConfig>>;

    /// Whether `id` names a thread whose opening post is on `board`
    async fn validate_op(&self, id: u64, board: &str) -> Result<bool>;

    // Open posts

    /// Persist a new thread and its opening post, allocating the
    /// thread ID from the global post counter. The OP is created open
    /// and claimed by its author like any other post; its `op` is the
    /// thread ID itself.
    async fn create_thread(
        &self,
        subject: &str,
        post: &StandalonePost,
        password_hash: &str,
    ) -> Result<u64>;

    /// Persist a new open post, allocating its ID from the global post
    /// counter. The post is created claimed by its author.
    async fn insert_post(&self, post: &StandalonePost, password_hash: &str) -> Result<u64>;

    /// Write the in-progress body of an open post
    async fn set_open_body(&self, id: u64, body: &str) -> Result<()>;

    /// Finalise an open post: persist the parsed body, release the
    /// claim, and apply any roulette loss in the same transaction
    async fn close_post(&self, params: ClosePost) -> Result<()>;

    /// Attach an image to an open post. The token must have been issued
    /// by the imager; an unknown token is a payload error.
    async fn insert_image(&self, id: u64, token: &str, name: &str, spoiler: bool)
        -> Result<Image>;

    async fn spoiler_image(&self, id: u64, op: u64) -> Result<()>;

    async fn get_post(&self, id: u64) -> Result<Option<StandalonePost>>;

    async fn get_post_password(&self, id: u64) -> Result<Option<String>>;

    /// Atomically transfer ownership of an editable post to the caller.
    /// Returns false if the post is not editable or already claimed by
    /// a live session.
    async fn claim_post(&self, id: u64) -> Result<bool>;

    /// Release the claim on an open post without closing it, so a
    /// disconnected author can reclaim it
    async fn release_post(&self, id: u64) -> Result<()>;

    // Counters

    async fn thread_counter(&self, id: u64) -> Result<u64>;

    async fn board_counter(&self, board: &str) -> Result<u64>;

    async fn all_board_counter(&self) -> Result<u64>;

    async fn increment_rcount(&self, thread: u64) -> Result<()>;

    async fn rcount(&self, thread: u64) -> Result<u64>;

    /// Overwrite the global post counter. Test and maintenance hook.
    async fn set_post_counter(&self, n: u64) -> Result<()>;

    // Hash command counters

    async fn pyu_increment(&self, board: &str) -> Result<u64>;

    async fn pyu_count(&self, board: &str) -> Result<u64>;

    // Snapshots consumed by the cache frontends

    /// A thread with its posts. `last` > 0 limits to the last N replies
    /// and marks the thread abbreviated.
    async fn thread_snapshot(&self, id: u64, last: i64) -> Result<Option<Thread>>;

    async fn board_snapshot(&self, board: &str, page: i64) -> Result<Board>;

    async fn catalog_snapshot(&self, board: &str) -> Result<Board>;

    async fn all_catalog_snapshot(&self) -> Result<Board>;

    // Admission

    /// The active ban matching the board (or a global ban), if any
    async fn is_banned(&self, board: &str, ip: IpAddr) -> Result<Option<BanRecord>>;

    async fn ban(
        &self,
        board: &str,
        reason: &str,
        by: &str,
        duration: Duration,
        ip: IpAddr,
        for_post: u64,
    ) -> Result<()>;

    /// Check a captcha solution and record the solve time for the IP
    async fn validate_captcha(&self, id: &str, solution: &str, ip: IpAddr) -> Result<bool>;

    async fn solved_captcha_recently(&self, ip: IpAddr, window: Duration) -> Result<bool>;

    // Auth sessions

    async fn register_account(&self, user_id: &str, password_hash: &str) -> Result<()>;

    async fn get_password(&self, user_id: &str) -> Result<Option<String>>;

    async fn change_password(&self, user_id: &str, password_hash: &str) -> Result<()>;

    async fn write_login_session(&self, user_id: &str, token: &str, expiry: Duration)
        -> Result<()>;

    async fn is_logged_in(&self, user_id: &str, token: &str) -> Result<bool>;

    async fn log_out(&self, user_id: &str, token: &str) -> Result<()>;

    async fn log_out_all(&self, user_id: &str) -> Result<()>;

    // Change feed

    /// Subscribe to a server-side change feed. Messages arrive on the
    /// returned receiver until it is dropped.
    async fn listen(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

impl BanRecord {
    /// Whether the ban is still in force
    pub fn active(&self) -> bool {
        self.expires > Utc::now()
    }
}

/// Run a store operation, retrying once on a transient store failure.
/// Guard and protocol errors are never retried.
pub async fn with_retry<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match f().await {
        Err(BackendError::Store(err)) => {
            tracing::warn!("retrying store operation: {}", err);
            f().await
        }
        other => other,
    }
}
