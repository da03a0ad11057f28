//! Common test utilities and helpers

use std::sync::Arc;

use kagami::backend::websocket::client::{ClientChannels, ClientHandle};
use kagami::shared::post::{Post, StandalonePost};

pub fn handle(ip: &str) -> (Arc<ClientHandle>, ClientChannels) {
    ClientHandle::new(ip.parse().unwrap())
}

pub fn sample_post(id: u64, op: u64, board: &str, body: &str) -> StandalonePost {
    StandalonePost {
        post: Post {
            id,
            editing: true,
            time: chrono::Utc::now().timestamp(),
            body: body.to_string(),
            ..Default::default()
        },
        op,
        board: board.to_string(),
    }
}
