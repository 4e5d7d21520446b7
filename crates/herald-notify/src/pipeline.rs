//! Persistence-then-broadcast orchestration.
//!
//! [`NotificationPipeline`] is the only entry point the HTTP layer and the
//! transport layer call into. Persistence is the durability gate: a record
//! that fails to persist is never broadcast. Broadcast is best effort and
//! never turns a successful ingest into a failure.

use std::sync::Arc;

use serde::Serialize;

use crate::capture::{capture, CaptureSettings, CapturedRequest, CapturedResponse};
use crate::dispatcher::{BroadcastDispatcher, DeliveryOutcome};
use crate::error::{NotifyError, StoreError};
use crate::record::{NotificationRecord, StoredNotification};
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionStatus};
use crate::session::{ClientEnvelope, PushSink};
use crate::store::NotificationStore;

/// Combined outcome of one ingest.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Whether the record reached the store.
    pub persisted: bool,
    /// The stored row, when persisted.
    pub notification: Option<StoredNotification>,
    /// One outcome per connection in the broadcast snapshot. Empty when the
    /// record was not persisted or nobody was connected.
    pub delivery: Vec<DeliveryOutcome>,
    /// Why persistence failed, when it did.
    pub failure: Option<String>,
}

impl PipelineResult {
    fn not_persisted(error: NotifyError) -> Self {
        Self {
            persisted: false,
            notification: None,
            delivery: Vec::new(),
            failure: Some(error.to_string()),
        }
    }

    /// Number of connections that received the record.
    pub fn delivered(&self) -> usize {
        self.delivery.iter().filter(|o| o.is_delivered()).count()
    }
}

/// Orchestrates capture, persistence, and broadcast.
#[derive(Clone)]
pub struct NotificationPipeline {
    store: Arc<dyn NotificationStore>,
    dispatcher: BroadcastDispatcher,
    capture: CaptureSettings,
}

impl NotificationPipeline {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: BroadcastDispatcher,
        capture: CaptureSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            capture,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }

    /// Validates, persists, then broadcasts `record`.
    ///
    /// # Errors
    ///
    /// Only `NotifyError::Validation`, raised before anything is persisted
    /// or sent. A persistence failure is reported as `persisted: false`.
    pub async fn ingest(&self, record: NotificationRecord) -> Result<PipelineResult, NotifyError> {
        if let Err(e) = record.validate() {
            tracing::warn!(method = %record.method, path = %record.path, "rejecting notification: {}", e);
            return Err(e);
        }

        let store = Arc::clone(&self.store);
        let persisted = tokio::task::spawn_blocking(move || store.store(&record))
            .await
            .unwrap_or_else(|e| Err(StoreError::Task(e.to_string())));

        let stored = match persisted {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("failed to persist notification: {}", e);
                return Ok(PipelineResult::not_persisted(NotifyError::Persistence(e)));
            }
        };

        tracing::info!(
            id = stored.id,
            method = %stored.record.method,
            path = %stored.record.path,
            status_code = ?stored.record.status_code,
            "notification persisted"
        );

        let delivery = self.dispatcher.broadcast_stored(&stored).await;

        Ok(PipelineResult {
            persisted: true,
            notification: Some(stored),
            delivery,
            failure: None,
        })
    }

    /// Captures and ingests one completed HTTP request/response cycle.
    ///
    /// # Errors
    ///
    /// `NotifyError::Validation` when the request had no method or path.
    pub async fn on_request_complete(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
    ) -> Result<PipelineResult, NotifyError> {
        let record = capture(&self.capture, request, response);
        self.ingest(record).await
    }

    /// Ingests a lifecycle event such as process start.
    ///
    /// # Errors
    ///
    /// `NotifyError::Validation` when `kind` is empty.
    pub async fn on_system_event(
        &self,
        kind: &str,
        detail: &str,
    ) -> Result<PipelineResult, NotifyError> {
        self.ingest(NotificationRecord::system(kind, detail)).await
    }

    /// Registers a freshly accepted push connection.
    ///
    /// # Errors
    ///
    /// `NotifyError::ResourceExhausted` when the registry is full.
    pub fn on_connection_open(&self, sink: PushSink) -> Result<ConnectionId, NotifyError> {
        self.registry().register(sink)
    }

    /// Forgets a connection the transport has seen close. Idempotent.
    pub fn on_connection_close(&self, id: ConnectionId) {
        self.registry().remove(id);
    }

    /// Handles a frame sent by a client.
    ///
    /// A valid acknowledgement marks the connection active. Anything else is
    /// logged and dropped; the transport is never handed an error.
    pub fn on_client_message(&self, id: ConnectionId, bytes: &[u8]) -> Option<ClientEnvelope> {
        match ClientEnvelope::parse(bytes) {
            Ok(envelope) => {
                tracing::debug!(
                    connection_id = %id,
                    status = %envelope.status,
                    notification_id = ?envelope.notification_id,
                    "client acknowledgement"
                );
                self.registry().touch(id, ConnectionStatus::Active);
                Some(envelope)
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %id,
                    len = bytes.len(),
                    "discarding unparseable client message: {}",
                    e
                );
                None
            }
        }
    }
}
