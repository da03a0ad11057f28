//! Session Tokens and Cookies
//!
//! Login sessions are identified by an opaque 171-character token
//! stored server-side. Two cookies carry the session to the client:
//! `loginID` (URL-escaped user ID) and `session` (the token). The
//! cookie expiry is one hour short of the server-side record so the
//! cookie always dies first.

use axum::http::HeaderMap;
use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::backend::db::{Result, Store};
use crate::shared::config::LEN_SESSION_TOKEN;

/// Generate an opaque session token
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LEN_SESSION_TOKEN)
        .map(char::from)
        .collect()
}

/// Percent-escape a cookie value the way `encodeURIComponent` does
fn escape_cookie_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

/// Build the `loginID` and `session` Set-Cookie values for a fresh
/// login. Expiry is `expiry_days` minus one hour.
pub fn session_cookies(user_id: &str, token: &str, expiry_days: i64) -> [String; 2] {
    let expires = chrono::Utc::now() + Duration::days(expiry_days) - Duration::hours(1);
    let expires = expires.format("%a, %d %b %Y %H:%M:%S GMT");
    [
        format!(
            "loginID={}; Path=/; Expires={}",
            escape_cookie_value(user_id),
            expires
        ),
        format!("session={}; Path=/; Expires={}; HttpOnly", token, expires),
    ]
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

fn unescape_cookie_value(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(Ok(byte)) = value
                .get(i + 1..i + 3)
                .map(|hex| u8::from_str_radix(hex, 16))
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolve the authenticated identity from the request cookies, if the
/// carried session is still live in the store
pub async fn identity_from_cookies(
    headers: &HeaderMap,
    store: &dyn Store,
) -> Result<Option<String>> {
    let cookies = match headers.get("cookie").and_then(|v| v.to_str().ok()) {
        Some(cookies) => cookies,
        None => return Ok(None),
    };
    let (user_id, token) = match (
        cookie_value(cookies, "loginID"),
        cookie_value(cookies, "session"),
    ) {
        (Some(user_id), Some(token)) => (unescape_cookie_value(user_id), token),
        _ => return Ok(None),
    };
    Ok(store
        .is_logged_in(&user_id, token)
        .await?
        .then_some(user_id))
}
