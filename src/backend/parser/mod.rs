//! Body Parser
//!
//! Parsing of finalised post bodies: cross-post links (`>>NNN`), hash
//! commands (`#flip`, `#NdM`, `#8ball`, `#sw`, `#pyu`, `#pcount`,
//! `#rcount`, `#roulette`) and the printability predicate applied to
//! every rune a client appends.
//!
//! The parser is injected into the post-update component as a trait
//! object so the update pipeline has no compile-time dependency on the
//! parsing rules. Command outcomes are resolved at close time, in body
//! order, by consulting the store and the process random source; the
//! persisted values are authoritative.

pub mod commands;
pub mod printable;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use crate::backend::db::{Result, Store};
use crate::shared::post::{Command, Link};

pub use printable::{check_printable, check_printable_str};

/// Extraction of links and commands from finalised bodies
#[async_trait]
pub trait BodyParser: Send + Sync {
    /// Parse a finalised body. `is_open` bodies only yield links;
    /// command outcomes are resolved on close.
    async fn parse_body(
        &self,
        body: &str,
        board: &str,
        op: u64,
        id: u64,
        ip: IpAddr,
        is_open: bool,
    ) -> Result<(Vec<Link>, Vec<Command>)>;
}

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#(flip|\d*d\d+|8ball|pyu|pcount|sw(?:\d+:)?\d+:\d+(?:[+-]\d+)?|roulette|rcount)$")
            .expect("command regex")
    })
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^>>(\d+)$").expect("link regex"))
}

/// Whether a word is a URL the client may embed. Such words are opaque
/// to the server side of the protocol.
pub fn is_url(word: &str) -> bool {
    word.starts_with("http://") || word.starts_with("https://") || word.starts_with("magnet:?")
}

/// The standard parser implementation
pub struct Parser {
    store: Arc<dyn Store>,
}

impl Parser {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve a `>>NNN` reference against the store. Dangling
    /// references are dropped rather than erroring: the target may have
    /// been deleted while the post was open.
    async fn parse_link(&self, target: u64) -> Result<Option<Link>> {
        Ok(self.store.get_post(target).await?.map(|post| Link {
            id: target,
            op: post.op,
            board: post.board,
        }))
    }
}

#[async_trait]
impl BodyParser for Parser {
    async fn parse_body(
        &self,
        body: &str,
        board: &str,
        op: u64,
        _id: u64,
        _ip: IpAddr,
        is_open: bool,
    ) -> Result<(Vec<Link>, Vec<Command>)> {
        let mut links = Vec::new();
        let mut commands = Vec::new();

        for word in body.split_whitespace() {
            if is_url(word) {
                continue;
            }
            if let Some(captures) = link_regex().captures(word) {
                if let Ok(target) = captures[1].parse::<u64>() {
                    if let Some(link) = self.parse_link(target).await? {
                        links.push(link);
                    }
                }
                continue;
            }
            if !is_open {
                if let Some(captures) = command_regex().captures(word) {
                    if let Some(command) =
                        commands::resolve(&captures[1], board, op, self.store.as_ref()).await?
                    {
                        commands.push(command);
                    }
                }
            }
        }

        Ok((links, commands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::db::MemStore;
    use crate::shared::post::Post;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    async fn parser_with_thread() -> Parser {
        let store = Arc::new(MemStore::new());
        store.write_thread(21, "a", "sub", Post::default()).await;
        store
            .write_post(
                crate::shared::StandalonePost {
                    post: Post {
                        id: 22,
                        time: 1,
                        ..Default::default()
                    },
                    op: 21,
                    board: "a".to_string(),
                },
                None,
            )
            .await;
        Parser::new(store)
    }

    #[tokio::test]
    async fn test_valid_link_extracted() {
        let parser = parser_with_thread().await;
        let (links, _) = parser
            .parse_body(" >>22 ", "a", 1, 2, ip(), false)
            .await
            .unwrap();
        assert_eq!(
            links,
            vec![Link {
                id: 22,
                op: 21,
                board: "a".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_dangling_link_dropped() {
        let parser = parser_with_thread().await;
        let (links, _) = parser
            .parse_body(">>9999", "a", 1, 2, ip(), false)
            .await
            .unwrap();
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn test_commands_skipped_while_open() {
        let parser = parser_with_thread().await;
        let (_, commands) = parser
            .parse_body("#flip", "a", 21, 2, ip(), true)
            .await
            .unwrap();
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn test_flip_resolved_on_close() {
        let parser = parser_with_thread().await;
        let (_, commands) = parser
            .parse_body("#flip", "a", 21, 2, ip(), false)
            .await
            .unwrap();
        assert!(matches!(commands[0], Command::Flip(_)));
    }

    #[tokio::test]
    async fn test_command_must_be_own_word() {
        let parser = parser_with_thread().await;
        let (_, commands) = parser
            .parse_body("x#flip #flipx", "a", 21, 2, ip(), false)
            .await
            .unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn test_url_detection() {
        assert!(is_url("https://example.com/a.webm"));
        assert!(!is_url(">>22"));
    }
}
