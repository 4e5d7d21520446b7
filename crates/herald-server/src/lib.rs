//! herald server library logic.
//!
//! Wires the notification core into an axum application: the audit
//! middleware feeds every HTTP call into the pipeline, and the WebSocket
//! endpoint registers observers that receive each persisted record.

pub mod api_notifications;
pub mod api_ws;
pub mod config;
pub mod middleware;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Json, Router};
use herald_db::DbPool;
use herald_notify::{
    BroadcastDispatcher, ConnectionRegistry, NotificationPipeline, SqliteNotificationStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Route of the push endpoint.
pub const WS_PATH: &str = "/ws/notifications";

/// Maximum request body size (2 MiB). The audit middleware buffers bodies,
/// so this also bounds its memory per request.
pub const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, used by the read endpoints.
    pub pool: DbPool,
    /// The notification pipeline; owns the connection registry.
    pub pipeline: NotificationPipeline,
    /// Outbound buffer size for each push connection.
    pub push_channel_capacity: usize,
    /// Bound on one socket write; a peer that stops reading is dropped.
    pub push_send_timeout: Duration,
    /// Request paths the audit middleware ignores.
    pub audit_skip_paths: Arc<Vec<String>>,
}

impl AppState {
    /// Builds the pipeline, registry, and store from configuration.
    pub fn new(pool: DbPool, config: &Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.notify.registry_limits()));
        let dispatcher = BroadcastDispatcher::new(registry, config.notify.dispatch_timeouts());
        let pipeline = NotificationPipeline::new(
            Arc::new(SqliteNotificationStore::new(pool.clone())),
            dispatcher,
            config.capture.settings(),
        );

        Self {
            pool,
            pipeline,
            push_channel_capacity: config.notify.channel_capacity,
            push_send_timeout: config.notify.dispatch_timeouts().per_send,
            audit_skip_paths: Arc::new(config.capture.skip_paths.clone()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.pipeline.registry()
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/notifications",
            get(api_notifications::list_notifications_handler),
        )
        .route(
            "/api/notifications/{id}",
            get(api_notifications::get_notification_handler),
        )
        .route(
            "/api/connections",
            get(api_notifications::list_connections_handler),
        )
        .route(WS_PATH, get(api_ws::ws_handler))
        .layer(axum::middleware::from_fn(middleware::audit_middleware))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
