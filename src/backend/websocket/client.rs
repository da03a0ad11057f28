//! Client Session
//!
//! Lifecycle of one WebSocket-connected client: the shared handle other
//! subsystems talk to, the receiver loop proxying socket reads, and the
//! listener loop arbitrating everything else.
//!
//! # Concurrency
//!
//! Exactly two tasks drive a session: the receiver performs the
//! blocking socket read and forwards frames over a channel; the
//! listener is the single-threaded arbiter selecting over the receive
//! channel, the outbound queue, the ping ticker, the redirect channel
//! and the close channel. All session state (the open post, the feed
//! pointer) is owned by the listener, so command handling needs no
//! locking.
//!
//! # Backpressure
//!
//! The outbound queue holds roughly one minute of feed flushes. A
//! client that cannot drain it is closed with a buffer overflow error
//! rather than slowing the feed down or reordering frames.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::backend::error::BackendError;
use crate::backend::feeds::Feed;
use crate::backend::server::state::AppState;
use crate::backend::websocket::open_post::OpenPost;
use crate::shared::message::{encode, MessageType};
use crate::shared::ProtocolError;

/// Outbound queue depth: about 60 seconds of flush ticks
const SEND_QUEUE_DEPTH: usize = 600;

const PING_INTERVAL: Duration = Duration::from_secs(60);
const PING_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A close request: None for graceful causes
pub type CloseSignal = Option<BackendError>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// The concurrency-safe face of a client session, shared with the feed
/// registry. The session itself is owned by its listener loop.
pub struct ClientHandle {
    id: u64,
    ip: IpAddr,
    send_tx: mpsc::Sender<String>,
    close_tx: mpsc::Sender<CloseSignal>,
    redirect_tx: mpsc::Sender<String>,
    /// Unix time of the client's last post activity. Read by feeds for
    /// the presence counter.
    last_time: AtomicI64,
    /// Current sync target: (thread, board). Written by the registry.
    sync: Mutex<Option<(u64, String)>>,
}

/// Receiver halves of the session channels, consumed by the listener
pub struct ClientChannels {
    pub send_rx: mpsc::Receiver<String>,
    pub close_rx: mpsc::Receiver<CloseSignal>,
    pub redirect_rx: mpsc::Receiver<String>,
}

impl ClientHandle {
    pub fn new(ip: IpAddr) -> (Arc<Self>, ClientChannels) {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (close_tx, close_rx) = mpsc::channel(2);
        let (redirect_tx, redirect_rx) = mpsc::channel(1);
        let handle = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            ip,
            send_tx,
            close_tx,
            redirect_tx,
            last_time: AtomicI64::new(0),
            sync: Mutex::new(None),
        });
        (
            handle,
            ClientChannels {
                send_rx,
                close_rx,
                redirect_rx,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Queue a frame for delivery. Never blocks: a full queue closes
    /// the session instead of reordering or dropping frames.
    pub fn send(&self, frame: String) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.send_tx.try_send(frame) {
            self.close(Some(ProtocolError::BufferOverflow.into()));
        }
    }

    /// Request session close. Idempotent; the first signal wins.
    pub fn close(&self, err: CloseSignal) {
        let _ = self.close_tx.try_send(err);
    }

    /// Ask the listener to move the client to another board
    pub fn redirect(&self, board: &str) {
        let _ = self.redirect_tx.try_send(board.to_string());
    }

    pub fn last_time(&self) -> i64 {
        self.last_time.load(Ordering::Relaxed)
    }

    pub fn set_last_time(&self) {
        self.last_time.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn sync_target(&self) -> Option<(u64, String)> {
        self.sync.lock().unwrap().clone()
    }

    pub fn set_sync_target(&self, target: Option<(u64, String)>) {
        *self.sync.lock().unwrap() = target;
    }
}

/// One connected client session. Owned and driven by its listener
/// loop.
pub struct Client {
    pub(crate) handle: Arc<ClientHandle>,
    pub(crate) state: AppState,
    /// Authenticated identity resolved from the session cookies at
    /// upgrade time
    pub(crate) user_id: Option<String>,
    pub(crate) got_first_message: bool,
    pub(crate) post: OpenPost,
    pub(crate) feed: Option<Arc<Feed>>,
}

impl Client {
    pub fn new(state: AppState, handle: Arc<ClientHandle>, user_id: Option<String>) -> Self {
        Self {
            handle,
            state,
            user_id,
            got_first_message: false,
            post: OpenPost::default(),
            feed: None,
        }
    }

    /// Drive the session to completion: spawn the receiver, run the
    /// listener, then release every resource the session held
    pub async fn run(mut self, socket: WebSocket, mut channels: ClientChannels) {
        if let Some(user_id) = &self.user_id {
            tracing::debug!(ip = %self.handle.ip(), user = %user_id, "authenticated session");
        }
        let (mut sink, stream) = socket.split();
        let (receive_tx, mut receive_rx) = mpsc::channel::<Message>(1);
        let receiver = tokio::spawn(receiver_loop(stream, receive_tx, self.handle.clone()));

        let result = self.listen(&mut sink, &mut receive_rx, &mut channels).await;
        receiver.abort();

        self.state.feeds.remove_client(&self.handle);
        if self.post.id != 0 {
            // Leave the post editable for reclaim by releasing the
            // ownership claim
            if let Err(err) = self.state.store.release_post(self.post.id).await {
                tracing::error!(ip = %self.handle.ip(), "releasing open post: {}", err);
            }
        }

        self.close_socket(&mut sink, &result).await;
        if let Err(err) = result {
            if err.is_ignorable() {
                tracing::debug!(ip = %self.handle.ip(), "session closed: {}", err);
            } else {
                tracing::error!(ip = %self.handle.ip(), "session error: {}", err);
            }
        }
    }

    async fn listen(
        &mut self,
        sink: &mut SplitSink<WebSocket, Message>,
        receive_rx: &mut mpsc::Receiver<Message>,
        channels: &mut ClientChannels,
    ) -> Result<(), BackendError> {
        // External proxies and CDNs tend to drop quiet connections, so
        // ping on a timer
        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ping = tokio::time::interval_at(start, PING_INTERVAL);

        loop {
            tokio::select! {
                signal = channels.close_rx.recv() => {
                    return match signal.flatten() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                frame = channels.send_rx.recv() => {
                    if let Some(frame) = frame {
                        sink.send(Message::Text(frame)).await?;
                    }
                }
                _ = ping.tick() => {
                    tokio::time::timeout(PING_WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new())))
                        .await
                        .map_err(|_| BackendError::websocket("ping write timeout"))??;
                }
                msg = receive_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_socket_message(msg).await?,
                        None => return Ok(()),
                    }
                }
                board = channels.redirect_rx.recv() => {
                    if let Some(board) = board {
                        self.handle_redirect(&board).await?;
                    }
                }
            }
        }
    }

    async fn handle_socket_message(&mut self, msg: Message) -> Result<(), BackendError> {
        match msg {
            Message::Text(text) => self.handle_frame(&text).await,
            Message::Close(_) => {
                self.handle.close(None);
                Ok(())
            }
            Message::Ping(_) | Message::Pong(_) => Ok(()),
            Message::Binary(_) => {
                Err(ProtocolError::invalid_frame("only text frames allowed").into())
            }
        }
    }

    /// Parse a received frame and dispatch it, applying the error
    /// propagation policy: guard failures and non-sync store errors
    /// become diagnostic frames, everything else terminates
    async fn handle_frame(&mut self, frame: &str) -> Result<(), BackendError> {
        let (raw_type, body) = crate::shared::message::split_frame(frame)?;
        let typ = MessageType::try_from(raw_type)?;

        if !self.got_first_message {
            if typ != MessageType::Synchronise {
                return Err(ProtocolError::invalid_payload(frame).into());
            }
            self.got_first_message = true;
            self.send_message(MessageType::ServerTime, &Utc::now().timestamp())?;
        }

        match self.run_handler(typ, body).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_guard_failure() => {
                if matches!(
                    err.as_protocol(),
                    Some(ProtocolError::CaptchaRequired)
                ) {
                    self.send_message(MessageType::Captcha, &())?;
                }
                self.send_message(MessageType::Invalid, &err.to_string())?;
                Ok(())
            }
            Err(err @ BackendError::Store(_))
                if !matches!(typ, MessageType::Synchronise | MessageType::Reclaim) =>
            {
                self.send_message(MessageType::Invalid, &err.to_string())?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_redirect(&mut self, board: &str) -> Result<(), BackendError> {
        self.send_message(MessageType::Redirect, &format!("/{}/", board))?;
        self.register_sync(crate::backend::websocket::synchronisation::SyncRequest {
            board: board.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Format a message and queue it for the client
    pub(crate) fn send_message<T: Serialize>(
        &self,
        typ: MessageType,
        payload: &T,
    ) -> Result<(), BackendError> {
        self.handle.send(encode(typ, payload)?);
        Ok(())
    }

    /// Send a close frame describing why the session ended. Failures
    /// are ignored; the peer may already be gone.
    async fn close_socket(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        result: &Result<(), BackendError>,
    ) {
        let frame = match result {
            Ok(()) => CloseFrame {
                code: 1000,
                reason: "".into(),
            },
            Err(err) if err.is_ignorable() => CloseFrame {
                code: 1000,
                reason: "".into(),
            },
            Err(err) => {
                // Give the client the reason before the close frame
                if let Ok(diag) = encode(MessageType::Invalid, &err.to_string()) {
                    let _ = sink.send(Message::Text(diag)).await;
                }
                CloseFrame {
                    code: err.close_code(),
                    reason: err.to_string().into(),
                }
            }
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

/// Proxy the blocking socket read into the listener's select loop
async fn receiver_loop(
    mut stream: SplitStream<WebSocket>,
    receive_tx: mpsc::Sender<Message>,
    handle: Arc<ClientHandle>,
) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if receive_tx.send(msg).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                handle.close(Some(err.into()));
                return;
            }
            None => {
                handle.close(None);
                return;
            }
        }
    }
}
