//! Server Configuration
//!
//! This module handles loading of server configuration from the
//! environment, with sensible defaults for local development. A
//! missing database URL selects the in-memory store rather than
//! preventing startup.

use std::time::Duration;

use crate::backend::admission::SpamConfig;
use crate::backend::cache::DEFAULT_CAPACITY;
use crate::backend::feeds::FLUSH_INTERVAL;
use crate::shared::BoardConfig;

/// Process configuration, loaded once at startup and owned by the
/// server top level
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Absent selects the in-memory store
    pub database_url: Option<String>,
    pub session_expiry_days: i64,
    pub spam: SpamConfig,
    /// Interval of the shared feed flusher
    pub flush_interval: Duration,
    /// Snapshot cache byte budget
    pub cache_capacity: usize,
    /// Boards to seed into the store at startup
    pub boards: Vec<BoardConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            database_url: None,
            session_expiry_days: 30,
            spam: SpamConfig::default(),
            flush_interval: FLUSH_INTERVAL,
            cache_capacity: DEFAULT_CAPACITY,
            boards: vec![BoardConfig {
                id: "a".to_string(),
                title: "Animu & Mango".to_string(),
                ..Default::default()
            }],
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
        }

        let boards = match std::env::var("BOARDS") {
            Ok(spec) => parse_boards(&spec),
            Err(_) => defaults.boards.clone(),
        };

        Self {
            port: env_parse("SERVER_PORT", defaults.port),
            database_url,
            session_expiry_days: env_parse("SESSION_EXPIRY_DAYS", defaults.session_expiry_days),
            spam: SpamConfig {
                threshold: env_parse("SPAM_THRESHOLD", defaults.spam.threshold),
                ..defaults.spam
            },
            flush_interval: Duration::from_millis(env_parse(
                "FLUSH_INTERVAL_MS",
                defaults.flush_interval.as_millis() as u64,
            )),
            cache_capacity: env_parse("CACHE_CAPACITY", defaults.cache_capacity),
            boards,
        }
    }
}

/// Parse the `BOARDS` variable: comma-separated `id:title` pairs
fn parse_boards(spec: &str) -> Vec<BoardConfig> {
    spec.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (id, title) = entry.split_once(':').unwrap_or((entry, entry));
            Some(BoardConfig {
                id: id.trim().to_string(),
                title: title.trim().to_string(),
                ..Default::default()
            })
        })
        .collect()
}
