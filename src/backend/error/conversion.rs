//! Error Conversion
//!
//! Conversion of backend errors into their externally visible forms:
//! the WebSocket close code sent to the client, the ignorable
//! classification applied before logging, and HTTP responses for the
//! JSON snapshot endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::backend::error::types::BackendError;

/// WebSocket close code for a graceful close
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a protocol violation
pub const CLOSE_INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;

impl BackendError {
    /// The WebSocket close code to send when this error terminates the
    /// session. Graceful causes close with Normal; protocol violations
    /// close with InvalidFramePayloadData so the error message survives
    /// in client debugging tools.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => CLOSE_INVALID_FRAME_PAYLOAD_DATA,
            Self::WebSocket(_) => CLOSE_NORMAL,
            _ => CLOSE_INVALID_FRAME_PAYLOAD_DATA,
        }
    }

    /// Whether this error carries no diagnostic value and should be
    /// suppressed from logs. Covers the peer disappearing in any of the
    /// usual ways.
    pub fn is_ignorable(&self) -> bool {
        match self {
            Self::WebSocket(message) => {
                let m = message.to_ascii_lowercase();
                m.contains("closed")
                    || m.contains("reset")
                    || m.contains("broken pipe")
                    || m.contains("going away")
                    || m.contains("protocol error")
            }
            _ => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Protocol(err) if err.closes_session() => StatusCode::BAD_REQUEST,
            Self::Protocol(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
