//! PostgreSQL Store
//!
//! Implementation of the [`Store`] contract on top of a PostgreSQL
//! connection pool. Composite operations run inside SQL transactions
//! with commit-or-rollback guaranteed on all exit paths; the change
//! feed rides on LISTEN/NOTIFY.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::Row;
use tokio::sync::mpsc;

use crate::backend::db::{BanRecord, ClosePost, Result, Store};
use crate::backend::error::BackendError;
use crate::shared::post::{Board, Image, Post, StandalonePost, Thread};
use crate::shared::{BoardConfig, ProtocolError};

const PAGE_SIZE: i64 = 15;
const ABBREV_POSTS: i64 = 5;

/// Store backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database and run pending migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        tracing::info!("database connection pool created");

        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|err| BackendError::config(format!("migrations failed: {}", err)))?;
        tracing::info!("database migrations completed");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` inside a transaction, committing on Ok and rolling back
    /// on Err
    pub async fn in_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
                &'c mut sqlx::Transaction<'static, sqlx::Postgres>,
            ) -> BoxFuture<'c, Result<T>>
            + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    async fn counter_value(&self, key: &str) -> Result<u64> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM counters WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or(0) as u64)
    }

    async fn bump_counters(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        thread: u64,
    ) -> Result<()> {
        let board: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE threads
            SET counter = counter + 1, update_time = $2
            WHERE id = $1
            RETURNING board
            "#,
        )
        .bind(thread as i64)
        .bind(Utc::now().timestamp())
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(board) = board {
            for key in [format!("board:{}", board), "all".to_string()] {
                sqlx::query(
                    r#"
                    INSERT INTO counters (key, value) VALUES ($1, 1)
                    ON CONFLICT (key) DO UPDATE SET value = counters.value + 1
                    "#,
                )
                .bind(key)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn thread_view(&self, id: u64, last: i64, catalog: bool) -> Result<Option<Thread>> {
        let row = sqlx::query(
            r#"
            SELECT board, subject, sticky, locked, post_count, image_count,
                   update_time, bump_time
            FROM threads
            WHERE id = $1
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let op = self
            .get_post(id)
            .await?
            .map(|p| p.post)
            .unwrap_or_default();
        let mut posts = Vec::new();
        let mut abbrev = false;
        if !catalog {
            let replies = sqlx::query(REPLIES_QUERY)
                .bind(id as i64)
                .fetch_all(&self.pool)
                .await?;
            posts = replies.iter().map(post_from_row).collect::<Result<_>>()?;
            if last > 0 && posts.len() > last as usize {
                posts.drain(..posts.len() - last as usize);
                abbrev = true;
            }
        }

        Ok(Some(Thread {
            abbrev,
            sticky: row.get("sticky"),
            locked: row.get("locked"),
            post_count: row.get::<i32, _>("post_count") as u32,
            image_count: row.get::<i32, _>("image_count") as u32,
            update_time: row.get("update_time"),
            bump_time: row.get("bump_time"),
            subject: row.get("subject"),
            board: row.get("board"),
            post: op,
            posts,
        }))
    }

    async fn catalog(&self, board: Option<&str>) -> Result<Board> {
        let ids: Vec<i64> = match board {
            Some(board) => {
                sqlx::query_scalar(
                    "SELECT id FROM threads WHERE board = $1 ORDER BY sticky DESC, bump_time DESC",
                )
                .bind(board)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM threads ORDER BY sticky DESC, bump_time DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(thread) = self.thread_view(id as u64, 0, true).await? {
                threads.push(thread);
            }
        }
        Ok(Board { pages: 1, threads })
    }
}

/// The replies of a thread, in posting order
const REPLIES_QUERY: &str = r#"
    SELECT id, op, board, editing, sage, name, time, body,
           image_name, image_sha1, image_spoiler, links, commands
    FROM posts
    WHERE op = $1 AND id != $1
    ORDER BY id
"#;

fn post_from_row(row: &PgRow) -> Result<Post> {
    let image = match row.get::<Option<String>, _>("image_name") {
        Some(name) => Some(Image {
            name,
            sha1: row.get::<Option<String>, _>("image_sha1").unwrap_or_default(),
            spoiler: row.get("image_spoiler"),
        }),
        None => None,
    };
    Ok(Post {
        editing: row.get("editing"),
        sage: row.get("sage"),
        id: row.get::<i64, _>("id") as u64,
        time: row.get("time"),
        body: row.get("body"),
        name: row.get("name"),
        image,
        links: serde_json::from_value(row.get("links"))?,
        commands: serde_json::from_value(row.get("commands"))?,
    })
}

fn standalone_from_row(row: &PgRow) -> Result<StandalonePost> {
    Ok(StandalonePost {
        post: post_from_row(row)?,
        op: row.get::<i64, _>("op") as u64,
        board: row.get("board"),
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_board(&self, config: &BoardConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO boards (id, title, text_only, locked)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET title = $2, text_only = $3, locked = $4
            "#,
        )
        .bind(&config.id)
        .bind(&config.title)
        .bind(config.text_only)
        .bind(config.locked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_board_configs(&self) -> Result<Vec<BoardConfig>> {
        let rows = sqlx::query("SELECT id, title, text_only, locked FROM boards ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| BoardConfig {
                id: row.get("id"),
                title: row.get("title"),
                text_only: row.get("text_only"),
                locked: row.get("locked"),
            })
            .collect())
    }

    async fn validate_op(&self, id: u64, board: &str) -> Result<bool> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM threads WHERE id = $1 AND board = $2")
                .bind(id as i64)
                .bind(board)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    async fn create_thread(
        &self,
        subject: &str,
        post: &StandalonePost,
        password_hash: &str,
    ) -> Result<u64> {
        let subject = subject.to_string();
        let post = post.clone();
        let password_hash = password_hash.to_string();
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO counters (key, value) VALUES ('post_counter', 1)
                    ON CONFLICT (key) DO UPDATE SET value = counters.value + 1
                    RETURNING value
                    "#,
                )
                .fetch_one(&mut **tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO threads (id, board, subject, update_time, bump_time)
                    VALUES ($1, $2, $3, $4, $4)
                    "#,
                )
                .bind(id)
                .bind(&post.board)
                .bind(&subject)
                .bind(Utc::now().timestamp())
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO posts
                        (id, op, board, editing, claimed, sage, name, time, body,
                         password_hash)
                    VALUES ($1, $1, $2, TRUE, TRUE, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(id)
                .bind(&post.board)
                .bind(post.post.sage)
                .bind(&post.post.name)
                .bind(post.post.time)
                .bind(&post.post.body)
                .bind(&password_hash)
                .execute(&mut **tx)
                .await?;

                PgStore::bump_counters(tx, id as u64).await?;
                Ok(id as u64)
            })
        })
        .await
    }

    async fn insert_post(&self, post: &StandalonePost, password_hash: &str) -> Result<u64> {
        let post = post.clone();
        let password_hash = password_hash.to_string();
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO counters (key, value) VALUES ('post_counter', 1)
                    ON CONFLICT (key) DO UPDATE SET value = counters.value + 1
                    RETURNING value
                    "#,
                )
                .fetch_one(&mut **tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO posts
                        (id, op, board, editing, claimed, sage, name, time, body,
                         password_hash)
                    VALUES ($1, $2, $3, TRUE, TRUE, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(id)
                .bind(post.op as i64)
                .bind(&post.board)
                .bind(post.post.sage)
                .bind(&post.post.name)
                .bind(post.post.time)
                .bind(&post.post.body)
                .bind(&password_hash)
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE threads
                    SET post_count = post_count + 1,
                        bump_time = CASE
                            WHEN NOT $2 AND post_count < $3 THEN $4
                            ELSE bump_time
                        END
                    WHERE id = $1
                    "#,
                )
                .bind(post.op as i64)
                .bind(post.post.sage)
                .bind(crate::shared::config::BUMP_LIMIT as i32)
                .bind(Utc::now().timestamp())
                .execute(&mut **tx)
                .await?;

                PgStore::bump_counters(tx, post.op).await?;
                Ok(id as u64)
            })
        })
        .await
    }

    async fn set_open_body(&self, id: u64, body: &str) -> Result<()> {
        let body = body.to_string();
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let op: Option<i64> =
                    sqlx::query_scalar("UPDATE posts SET body = $2 WHERE id = $1 RETURNING op")
                        .bind(id as i64)
                        .bind(&body)
                        .fetch_optional(&mut **tx)
                        .await?;
                match op {
                    Some(op) => PgStore::bump_counters(tx, op as u64).await,
                    None => Err(BackendError::Store(sqlx::Error::RowNotFound)),
                }
            })
        })
        .await
    }

    async fn close_post(&self, params: ClosePost) -> Result<()> {
        self.in_transaction(move |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE posts
                    SET editing = FALSE, claimed = FALSE, body = $2,
                        links = $3, commands = $4
                    WHERE id = $1
                    "#,
                )
                .bind(params.id as i64)
                .bind(&params.body)
                .bind(serde_json::to_value(&params.links)?)
                .bind(serde_json::to_value(&params.commands)?)
                .execute(&mut **tx)
                .await?;

                if let Some(loss) = &params.roulette_loss {
                    sqlx::query(
                        r#"
                        INSERT INTO bans (board, ip, expires, reason, issued_by, for_post)
                        VALUES ($1, $2, $3, 'lost at #roulette', 'system', $4)
                        "#,
                    )
                    .bind(&loss.board)
                    .bind(loss.ip.to_string())
                    .bind(Utc::now() + Duration::hours(1))
                    .bind(params.id as i64)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query("UPDATE threads SET rcount = rcount + 1 WHERE id = $1")
                        .bind(params.op as i64)
                        .execute(&mut **tx)
                        .await?;
                }

                PgStore::bump_counters(tx, params.op).await
            })
        })
        .await
    }

    async fn insert_image(
        &self,
        id: u64,
        token: &str,
        name: &str,
        spoiler: bool,
    ) -> Result<Image> {
        let token = token.to_string();
        let name = name.to_string();
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let sha1: Option<String> = sqlx::query_scalar(
                    "DELETE FROM image_tokens WHERE token = $1 AND expires > NOW() RETURNING sha1",
                )
                .bind(&token)
                .fetch_optional(&mut **tx)
                .await?;
                let sha1 = sha1
                    .ok_or(ProtocolError::invalid_payload("unknown image token"))?;

                let op: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE posts
                    SET image_name = $2, image_sha1 = $3, image_spoiler = $4
                    WHERE id = $1
                    RETURNING op
                    "#,
                )
                .bind(id as i64)
                .bind(&name)
                .bind(&sha1)
                .bind(spoiler)
                .fetch_optional(&mut **tx)
                .await?;
                let op = op.ok_or(BackendError::Store(sqlx::Error::RowNotFound))?;

                sqlx::query("UPDATE threads SET image_count = image_count + 1 WHERE id = $1")
                    .bind(op)
                    .execute(&mut **tx)
                    .await?;
                PgStore::bump_counters(tx, op as u64).await?;

                Ok(Image {
                    name,
                    sha1,
                    spoiler,
                })
            })
        })
        .await
    }

    async fn spoiler_image(&self, id: u64, op: u64) -> Result<()> {
        self.in_transaction(move |tx| {
            Box::pin(async move {
                sqlx::query("UPDATE posts SET image_spoiler = TRUE WHERE id = $1")
                    .bind(id as i64)
                    .execute(&mut **tx)
                    .await?;
                PgStore::bump_counters(tx, op).await
            })
        })
        .await
    }

    async fn get_post(&self, id: u64) -> Result<Option<StandalonePost>> {
        let row = sqlx::query(
            r#"
            SELECT id, op, board, editing, sage, name, time, body,
                   image_name, image_sha1, image_spoiler, links, commands
            FROM posts
            WHERE id = $1
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(standalone_from_row).transpose()
    }

    async fn get_post_password(&self, id: u64) -> Result<Option<String>> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT password_hash FROM posts WHERE id = $1")
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash.flatten())
    }

    async fn claim_post(&self, id: u64) -> Result<bool> {
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE posts SET claimed = TRUE
            WHERE id = $1 AND editing AND NOT claimed
            RETURNING id
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn release_post(&self, id: u64) -> Result<()> {
        sqlx::query("UPDATE posts SET claimed = FALSE WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn thread_counter(&self, id: u64) -> Result<u64> {
        let counter: Option<i64> = sqlx::query_scalar("SELECT counter FROM threads WHERE id = $1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(counter.unwrap_or(0) as u64)
    }

    async fn board_counter(&self, board: &str) -> Result<u64> {
        self.counter_value(&format!("board:{}", board)).await
    }

    async fn all_board_counter(&self) -> Result<u64> {
        self.counter_value("all").await
    }

    async fn increment_rcount(&self, thread: u64) -> Result<()> {
        sqlx::query("UPDATE threads SET rcount = rcount + 1 WHERE id = $1")
            .bind(thread as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rcount(&self, thread: u64) -> Result<u64> {
        let rcount: Option<i64> = sqlx::query_scalar("SELECT rcount FROM threads WHERE id = $1")
            .bind(thread as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rcount.unwrap_or(0) as u64)
    }

    async fn set_post_counter(&self, n: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO counters (key, value) VALUES ('post_counter', $1)
            ON CONFLICT (key) DO UPDATE SET value = $1
            "#,
        )
        .bind(n as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pyu_increment(&self, board: &str) -> Result<u64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (key, value) VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE SET value = counters.value + 1
            RETURNING value
            "#,
        )
        .bind(format!("pyu:{}", board))
        .fetch_one(&self.pool)
        .await?;
        Ok(value as u64)
    }

    async fn pyu_count(&self, board: &str) -> Result<u64> {
        self.counter_value(&format!("pyu:{}", board)).await
    }

    async fn thread_snapshot(&self, id: u64, last: i64) -> Result<Option<Thread>> {
        self.thread_view(id, last, false).await
    }

    async fn board_snapshot(&self, board: &str, page: i64) -> Result<Board> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads WHERE board = $1")
            .bind(board)
            .fetch_one(&self.pool)
            .await?;
        let pages = ((total.max(1) + PAGE_SIZE - 1) / PAGE_SIZE) as u32;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM threads WHERE board = $1
            ORDER BY sticky DESC, bump_time DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(board)
        .bind(PAGE_SIZE)
        .bind(page.max(0) * PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(thread) = self.thread_view(id as u64, ABBREV_POSTS, false).await? {
                threads.push(thread);
            }
        }
        Ok(Board { pages, threads })
    }

    async fn catalog_snapshot(&self, board: &str) -> Result<Board> {
        self.catalog(Some(board)).await
    }

    async fn all_catalog_snapshot(&self) -> Result<Board> {
        self.catalog(None).await
    }

    async fn is_banned(&self, board: &str, ip: IpAddr) -> Result<Option<BanRecord>> {
        let row = sqlx::query(
            r#"
            SELECT board, ip, expires, reason, issued_by, for_post
            FROM bans
            WHERE ip = $1 AND (board = $2 OR board = 'all') AND expires > NOW()
            ORDER BY expires DESC
            LIMIT 1
            "#,
        )
        .bind(ip.to_string())
        .bind(board)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| BanRecord {
            board: row.get("board"),
            ip,
            expires: row.get("expires"),
            reason: row.get("reason"),
            by: row.get("issued_by"),
            for_post: row.get::<i64, _>("for_post") as u64,
        }))
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
        sqlx::query(
            r#"
            INSERT INTO bans (board, ip, expires, reason, issued_by, for_post)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(board)
        .bind(ip.to_string())
        .bind(Utc::now() + duration)
        .bind(reason)
        .bind(by)
        .bind(for_post as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn validate_captcha(&self, id: &str, solution: &str, ip: IpAddr) -> Result<bool> {
        let id = id.to_string();
        let solution = solution.to_string();
        self.in_transaction(move |tx| {
            Box::pin(async move {
                let deleted: Option<String> = sqlx::query_scalar(
                    "DELETE FROM captchas WHERE id = $1 AND solution = $2 RETURNING id",
                )
                .bind(&id)
                .bind(&solution)
                .fetch_optional(&mut **tx)
                .await?;
                if deleted.is_none() {
                    return Ok(false);
                }
                sqlx::query(
                    r#"
                    INSERT INTO solved_captchas (ip, solved_at) VALUES ($1, NOW())
                    ON CONFLICT (ip) DO UPDATE SET solved_at = NOW()
                    "#,
                )
                .bind(ip.to_string())
                .execute(&mut **tx)
                .await?;
                Ok(true)
            })
        })
        .await
    }

    async fn solved_captcha_recently(&self, ip: IpAddr, window: Duration) -> Result<bool> {
        let solved: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM solved_captchas WHERE ip = $1 AND solved_at > $2",
        )
        .bind(ip.to_string())
        .bind(Utc::now() - window)
        .fetch_optional(&self.pool)
        .await?;
        Ok(solved.is_some())
    }

    async fn register_account(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let result = sqlx::query("INSERT INTO accounts (id, password_hash) VALUES ($1, $2)")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(ProtocolError::AccessDenied("login ID already taken".to_string()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_password(&self, user_id: &str) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM accounts WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash)
    }

    async fn change_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_login_session(
        &self,
        user_id: &str,
        token: &str,
        expiry: Duration,
    ) -> Result<()> {
        sqlx::query("INSERT INTO sessions (account, token, expires) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(token)
            .bind(Utc::now() + expiry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_logged_in(&self, user_id: &str, token: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sessions WHERE account = $1 AND token = $2 AND expires > NOW()",
        )
        .bind(user_id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn log_out(&self, user_id: &str, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE account = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_out_all(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE account = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if tx.send(notification.payload().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(channel = %channel, "change feed error: {}", err);
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
