//! The send half of a push connection and the client acknowledgement
//! envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::error::DeliveryError;

/// Handle the registry keeps for each connection.
///
/// The transport owns the matching receiver and a writer task that drains
/// it into the socket. When that task exits the receiver is dropped and
/// every later send fails with [`DeliveryError::Closed`].
#[derive(Debug, Clone)]
pub struct PushSink {
    tx: mpsc::Sender<String>,
}

impl PushSink {
    /// Creates a sink and the receiver its writer task should drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wraps an existing sender.
    pub fn from_sender(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queues one message, waiting at most `timeout` for buffer space.
    ///
    /// # Errors
    ///
    /// `Closed` if the writer is gone, `TimedOut` if the buffer stayed full.
    pub async fn send(&self, message: String, timeout: Duration) -> Result<(), DeliveryError> {
        match self.tx.send_timeout(message, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::TimedOut(timeout)),
        }
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Acknowledgement a client sends after receiving a broadcast, e.g.
/// `{"status": "received", "notification_id": 12, "timestamp": "..."}`.
/// `notification_id` echoes the `id` of the pushed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub status: String,
    #[serde(default)]
    pub notification_id: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ClientEnvelope {
    /// Parses raw frame bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
