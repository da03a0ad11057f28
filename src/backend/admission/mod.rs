//! Admission
//!
//! Process-owned admission state consulted on every connection and
//! mutation: the live-connection registry per IP, the spam score map,
//! and the ban and captcha gates backed by the store.
//!
//! The score map and connection registry are the only admission state
//! held in memory; bans and captcha solves live in the store so they
//! survive restarts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Duration;

use crate::backend::db::{Result, Store};
use crate::shared::ProtocolError;

/// Maximum concurrent WebSocket connections per IP
const MAX_CONNECTIONS_PER_IP: usize = 16;

/// Window within which a solved captcha quiets the spam gate
const CAPTCHA_WINDOW_HOURS: i64 = 1;

/// Spam scoring tunables
#[derive(Debug, Clone)]
pub struct SpamConfig {
    /// Score added per appended character
    pub char_score: u64,
    /// Score added per allocated post
    pub post_creation_score: u64,
    /// Score above which mutations require a solved captcha
    pub threshold: u64,
    /// Score decay per second of inactivity
    pub decay_per_second: f64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            char_score: 1,
            post_creation_score: 100,
            threshold: 2000,
            decay_per_second: 8.0,
        }
    }
}

#[derive(Debug)]
struct SpamScore {
    value: f64,
    updated: Instant,
}

/// Admission state and gates
pub struct Admission {
    store: Arc<dyn Store>,
    config: SpamConfig,
    scores: Mutex<HashMap<IpAddr, SpamScore>>,
    connections: Mutex<HashMap<IpAddr, usize>>,
}

impl Admission {
    pub fn new(store: Arc<dyn Store>, config: SpamConfig) -> Self {
        Self {
            store,
            config,
            scores: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a live connection for the IP. Prevents connection spam.
    pub fn register_ip(&self, ip: IpAddr) -> std::result::Result<(), ProtocolError> {
        let mut connections = self.connections.lock().unwrap();
        let count = connections.entry(ip).or_insert(0);
        if *count >= MAX_CONNECTIONS_PER_IP {
            return Err(ProtocolError::AccessDenied(
                "too many connections".to_string(),
            ));
        }
        *count += 1;
        Ok(())
    }

    pub fn unregister_ip(&self, ip: IpAddr) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(count) = connections.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }

    /// Reject the connection if the IP is banned on the board or
    /// globally
    pub async fn check_banned(&self, board: &str, ip: IpAddr) -> Result<()> {
        match self.store.is_banned(board, ip).await? {
            Some(ban) => Err(ProtocolError::Banned(ban.reason).into()),
            None => Ok(()),
        }
    }

    /// Add spam score for the IP. Returns true if the score has crossed
    /// the captcha threshold.
    pub fn increment_spam_score(&self, ip: IpAddr, score: u64) -> bool {
        let mut scores = self.scores.lock().unwrap();
        let now = Instant::now();
        let entry = scores.entry(ip).or_insert(SpamScore {
            value: 0.0,
            updated: now,
        });
        let decayed =
            entry.value - now.duration_since(entry.updated).as_secs_f64() * self.config.decay_per_second;
        entry.value = decayed.max(0.0) + score as f64;
        entry.updated = now;
        entry.value > self.config.threshold as f64
    }

    fn over_threshold(&self, ip: IpAddr) -> bool {
        let scores = self.scores.lock().unwrap();
        match scores.get(&ip) {
            Some(entry) => {
                let decayed = entry.value
                    - entry.updated.elapsed().as_secs_f64() * self.config.decay_per_second;
                decayed > self.config.threshold as f64
            }
            None => false,
        }
    }

    /// Gate a mutation on the spam score. Over the threshold, the
    /// mutation is rejected until the IP has a recent captcha solve,
    /// which also resets the score.
    pub async fn captcha_gate(&self, ip: IpAddr) -> Result<()> {
        if !self.over_threshold(ip) {
            return Ok(());
        }
        let solved = self
            .store
            .solved_captcha_recently(ip, Duration::hours(CAPTCHA_WINDOW_HOURS))
            .await?;
        if solved {
            self.scores.lock().unwrap().remove(&ip);
            Ok(())
        } else {
            Err(ProtocolError::CaptchaRequired.into())
        }
    }

    pub fn spam_config(&self) -> &SpamConfig {
        &self.config
    }
}
