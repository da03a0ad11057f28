//! WebSocket Module
//!
//! Manages active WebSocket connections and the messages received from
//! and sent to them: the upgrade handler, the client session lifecycle,
//! the open-post state machine and the synchronisation handlers.

pub mod client;
pub mod handlers;
pub mod open_post;
pub mod post_updates;
pub mod synchronisation;

use std::net::{IpAddr, SocketAddr};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::backend::auth::identity_from_cookies;
use crate::backend::error::BackendError;
use crate::backend::server::state::AppState;

pub use client::{Client, ClientHandle};
pub use open_post::OpenPost;

/// Resolve the client IP, honoring a forwarding proxy
fn request_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

/// Respond to a new WebSocket connection request: admit the IP,
/// resolve any authenticated identity from the session cookies, then
/// upgrade and run the session to completion
pub async fn handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = request_ip(&headers, addr);

    if let Err(err) = state.admission.check_banned("all", ip).await {
        return err.into_response();
    }
    if let Err(err) = state.admission.register_ip(ip) {
        return BackendError::from(err).into_response();
    }

    let user_id = match identity_from_cookies(&headers, state.store.as_ref()).await {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::warn!(ip = %ip, "resolving login session: {}", err);
            None
        }
    };

    ws.on_upgrade(move |socket| async move {
        tracing::debug!(ip = %ip, "websocket session opened");
        let (handle, channels) = ClientHandle::new(ip);
        let client = Client::new(state.clone(), handle, user_id);
        client.run(socket, channels).await;
        state.admission.unregister_ip(ip);
        tracing::debug!(ip = %ip, "websocket session closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(
            request_ip(&headers, addr),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_request_ip_falls_back_to_peer() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        assert_eq!(
            request_ip(&HeaderMap::new(), addr),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }
}
