use axum::extract::ws::Utf8Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::{self, ScannerMessage};

/// Stable integer handle assigned at accept time. The transport task carries
/// only this id; all lookups are keyed by it rather than by the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued to a connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Pre-encoded text payload.
    Text(Utf8Bytes),
    /// Graceful close handshake; the writer sends a close frame and exits.
    Close,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0}: outbound channel closed")]
    ChannelClosed(ConnectionId),
    #[error(transparent)]
    Encode(#[from] messages::EncodeError),
}

/// One open duplex session. The manager owns the registry entry; the
/// receive loop and writer task reference the connection through it.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Identity resolved during connection admission.
    pub identity: String,
    sender: mpsc::Sender<OutboundFrame>,
}

impl Connection {
    pub fn new(id: ConnectionId, identity: String, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id,
            identity,
            sender,
        }
    }

    /// Queue pre-encoded payload bytes for this connection.
    pub async fn send_text(&self, payload: Utf8Bytes) -> Result<(), DeliveryError> {
        self.sender
            .send(OutboundFrame::Text(payload))
            .await
            .map_err(|_| DeliveryError::ChannelClosed(self.id))
    }

    /// Encode and queue a message for this connection only.
    pub async fn send_message(&self, message: &ScannerMessage) -> Result<(), DeliveryError> {
        self.send_text(messages::encode(message)?).await
    }

    /// Ask the writer task to perform a graceful close. Best effort; a
    /// connection whose writer already exited is fine to close again.
    pub async fn close(&self) {
        let _ = self.sender.send(OutboundFrame::Close).await;
    }
}
