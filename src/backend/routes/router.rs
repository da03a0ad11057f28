//! Router Configuration
//!
//! This module combines all route configurations into a single Axum
//! router: the WebSocket endpoint, the health probe and the JSON
//! snapshot endpoints served from the cache.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::backend::cache::Key;
use crate::backend::error::BackendError;
use crate::backend::server::state::AppState;
use crate::backend::websocket;
use crate::shared::ProtocolError;

/// Create the Axum router with all routes configured
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/socket", get(websocket::handler))
        .route("/api/health", get(health))
        .route("/api/json/catalog", get(all_catalog))
        .route("/api/json/boards/:board/catalog", get(board_catalog))
        .route("/api/json/boards/:board/:page", get(board_page))
        .route("/api/json/threads/:id", get(thread))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn json_response(json: bytes::Bytes) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], json).into_response()
}

async fn thread(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, BackendError> {
    let last: i64 = params
        .get("last")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let (json, _, _) = state
        .cache
        .get_json(Key::thread(id, last), &state.frontends.thread)
        .await?;
    Ok(json_response(json))
}

async fn board_page(
    State(state): State<AppState>,
    Path((board, page)): Path<(String, i64)>,
) -> Result<Response, BackendError> {
    if !state.boards.is_board(&board) {
        return Err(ProtocolError::InvalidBoard(board).into());
    }
    let (json, _, _) = state
        .cache
        .get_json(
            Key::board_page(&board, page, true),
            &state.frontends.board_page,
        )
        .await?;
    Ok(json_response(json))
}

async fn board_catalog(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Response, BackendError> {
    if !state.boards.is_board(&board) {
        return Err(ProtocolError::InvalidBoard(board).into());
    }
    let (json, _, _) = state
        .cache
        .get_json(Key::catalog(&board), &state.frontends.catalog)
        .await?;
    Ok(json_response(json))
}

async fn all_catalog(State(state): State<AppState>) -> Result<Response, BackendError> {
    let (json, _, _) = state
        .cache
        .get_json(Key::all_catalog(), &state.frontends.all_catalog)
        .await?;
    Ok(json_response(json))
}
