//! Real-time notification core for herald.
//!
//! Every inbound API call becomes a persisted audit record that is then
//! pushed to every live observer connection.
//!
//! # Flow
//!
//! 1. The HTTP layer buffers a request/response pair and calls
//!    [`NotificationPipeline::on_request_complete`]; [`capture`] turns the
//!    pair into a [`NotificationRecord`].
//! 2. [`NotificationPipeline::ingest`] validates the record and writes it
//!    through a [`NotificationStore`]. A record that fails to persist stops
//!    here.
//! 3. The [`BroadcastDispatcher`] sends the serialized record to every
//!    connection in a [`ConnectionRegistry`] snapshot, concurrently, and
//!    reaps every connection whose send failed.
//!
//! The transport layer talks to the same pipeline through
//! `on_connection_open`, `on_connection_close` and `on_client_message`.
//!
//! ```rust,ignore
//! let registry = Arc::new(ConnectionRegistry::new(RegistryLimits::default()));
//! let dispatcher = BroadcastDispatcher::new(registry, DispatchTimeouts::default());
//! let pipeline = NotificationPipeline::new(
//!     Arc::new(SqliteNotificationStore::new(pool)),
//!     dispatcher,
//!     CaptureSettings::default(),
//! );
//! pipeline.on_system_event("startup", "herald 0.1.0").await?;
//! ```

mod capture;
mod dispatcher;
mod error;
mod pipeline;
mod record;
mod registry;
mod session;
mod store;

pub use capture::{capture, CaptureSettings, CapturedRequest, CapturedResponse, REDACTED};
pub use dispatcher::{BroadcastDispatcher, DeliveryOutcome, DeliveryStatus, DispatchTimeouts};
pub use error::{DeliveryError, NotifyError, StoreError};
pub use pipeline::{NotificationPipeline, PipelineResult};
pub use record::{NotificationRecord, StoredNotification, SYSTEM_METHOD};
pub use registry::{
    Connection, ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionStatus,
    RegistryLimits,
};
pub use session::{ClientEnvelope, PushSink};
pub use store::{
    get_notification, insert_notification, query_notifications, NotificationFilter,
    NotificationStore, SqliteNotificationStore, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT,
};
