//! Open Post Buffer
//!
//! The in-memory representation of a post being typed: the body buffer
//! and the counters the guards are enforced against. All offsets are
//! rune offsets; the buffer itself is UTF-8.
//!
//! Mutations validate before committing, so a rejected operation leaves
//! the buffer untouched and the session can continue.

use serde::{Deserialize, Serialize};

use crate::backend::parser::check_printable_str;
use crate::shared::config::{MAX_LEN_BODY, MAX_LINES_BODY};
use crate::shared::post::StandalonePost;
use crate::shared::ProtocolError;

/// A post currently open by a client. `id` 0 means none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenPost {
    pub id: u64,
    pub op: u64,
    pub board: String,
    pub body: String,
    /// Body length in runes
    pub len: usize,
    pub lines: usize,
    pub has_image: bool,
    pub is_spoilered: bool,
    /// Unix creation time, for the 29 minute auto-close
    pub time: i64,
}

/// The wire fields of a splice broadcast after bounds adjustment.
/// `len` of -1 signals "to end of line" on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceEffect {
    pub start: u64,
    pub len: i64,
    pub text: String,
}

impl OpenPost {
    /// Rehydrate from a stored post on reclaim
    pub fn init(post: &StandalonePost) -> Self {
        let body = post.post.body.clone();
        Self {
            id: post.post.id,
            op: post.op,
            board: post.board.clone(),
            len: body.chars().count(),
            lines: body.matches('\n').count(),
            has_image: post.post.image.is_some(),
            is_spoilered: post.post.image.as_ref().map(|i| i.spoiler).unwrap_or(false),
            time: post.post.time,
            body,
        }
    }

    /// Append one rune to the buffer
    pub fn append(&mut self, r: char) -> Result<(), ProtocolError> {
        if self.len + 1 > MAX_LEN_BODY {
            return Err(ProtocolError::BodyTooLong);
        }
        if r == '\n' && self.lines + 1 > MAX_LINES_BODY {
            return Err(ProtocolError::TooManyLines);
        }
        crate::backend::parser::check_printable(r, true)?;

        self.body.push(r);
        self.len += 1;
        if r == '\n' {
            self.lines += 1;
        }
        Ok(())
    }

    /// Remove the last rune. Returns the removed rune.
    pub fn backspace(&mut self) -> Result<char, ProtocolError> {
        let popped = self.body.pop().ok_or(ProtocolError::EmptyPost)?;
        self.len -= 1;
        if popped == '\n' {
            self.lines -= 1;
        }
        Ok(popped)
    }

    /// Replace the rune range `[start, start + len)` with `text`,
    /// truncating from the end if the result would exceed the body
    /// limit. Returns the effective wire fields of the mutation.
    pub fn splice(&mut self, start: u64, len: u64, text: &str) -> Result<SpliceEffect, ProtocolError> {
        let text_len = text.chars().count();
        if start > MAX_LEN_BODY as u64
            || len > MAX_LEN_BODY as u64
            || (start + len) as usize > self.len
        {
            return Err(ProtocolError::InvalidSpliceCoords {
                start,
                len,
                body_len: self.len,
            });
        }
        if len == 0 && text.is_empty() {
            return Err(ProtocolError::SpliceNoop);
        }
        if text_len > MAX_LEN_BODY {
            return Err(ProtocolError::SpliceTooLong);
        }
        check_printable_str(text, true)?;

        let old: Vec<char> = self.body.chars().collect();
        let start_us = start as usize;
        let mut tail: Vec<char> = text.chars().collect();
        tail.extend_from_slice(&old[start_us + len as usize..]);

        let mut new_len = start_us + tail.len();
        let mut effect = SpliceEffect {
            start,
            len: len as i64,
            text: text.to_string(),
        };

        // Past the body limit, the replacement swallows everything to
        // the end and gets truncated itself
        let exceeding = new_len as i64 - MAX_LEN_BODY as i64;
        if exceeding > 0 {
            tail.truncate(tail.len() - exceeding as usize);
            effect.len = -1;
            effect.text = tail.iter().collect();
            new_len = MAX_LEN_BODY;
        }

        let mut body: String = old[..start_us].iter().collect();
        body.extend(tail.iter());
        let lines = body.matches('\n').count();
        if lines > MAX_LINES_BODY {
            return Err(ProtocolError::TooManyLines);
        }

        self.body = body;
        self.len = new_len;
        self.lines = lines;
        Ok(effect)
    }
}
