//! Message Handler Dispatch
//!
//! Central routing of typed client frames to their handlers.

use serde::de::DeserializeOwned;

use crate::backend::error::BackendError;
use crate::backend::websocket::client::Client;
use crate::shared::message::MessageType;
use crate::shared::ProtocolError;

/// Decode a message payload into the supplied type
pub(crate) fn decode_payload<T: DeserializeOwned>(data: &str) -> Result<T, BackendError> {
    serde_json::from_str(data).map_err(|_| ProtocolError::invalid_payload(data).into())
}

impl Client {
    /// Run the appropriate handler for a client frame
    pub(crate) async fn run_handler(
        &mut self,
        typ: MessageType,
        data: &str,
    ) -> Result<(), BackendError> {
        match typ {
            MessageType::Synchronise => self.synchronise(data).await,
            MessageType::Reclaim => self.reclaim_post(data).await,
            MessageType::InsertPost => self.insert_post(data).await,
            MessageType::Append => self.append_rune(data).await,
            MessageType::Backspace => self.backspace().await,
            MessageType::Splice => self.splice_text(data).await,
            MessageType::ClosePost => self.close_post().await,
            MessageType::InsertImage => self.insert_image(data).await,
            MessageType::Spoiler => self.spoiler_image().await,
            // One-way pseudo-ping
            MessageType::Noop => Ok(()),
            MessageType::MeguTv => {
                self.state.feeds.subscribe_tv(self.handle.clone());
                Ok(())
            }
            _ => Err(ProtocolError::invalid_payload(data).into()),
        }
    }
}
