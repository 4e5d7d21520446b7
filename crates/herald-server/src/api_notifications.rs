//! Read-only HTTP API over the notification log and the push registry.
//!
//! Provides:
//! - `GET /api/notifications` — filterable, paginated history, newest first
//! - `GET /api/notifications/{id}` — one stored record
//! - `GET /api/connections` — current push connections and their status

use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_notify::{
    get_notification, query_notifications, ConnectionInfo, NotificationFilter, StoreError,
    StoredNotification,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters for `GET /api/notifications`.
#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub method: Option<String>,
    pub path: Option<String>,
    pub user_id: Option<i64>,
    /// RFC 3339 timestamp; only records persisted at or after it.
    pub since: Option<String>,
    pub offset: Option<i64>,
    /// Page size (default 100, max 1000).
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub notifications: Vec<StoredNotification>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Runs a store read on the blocking pool with a pooled connection.
async fn with_connection<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(StoreError::from)?;
        f(&conn)
    })
    .await
    .map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("task join error: {}", e),
        )
    })?
    .map_err(|e| {
        tracing::error!("notification read failed: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Handler for `GET /api/notifications`.
pub async fn list_notifications_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<NotificationsQuery>,
) -> Result<Json<NotificationsResponse>, Response> {
    let since = match params.since.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| {
                    error_response(
                        StatusCode::BAD_REQUEST,
                        format!("invalid since: {}. Expected an RFC 3339 timestamp", raw),
                    )
                })?,
        ),
        None => None,
    };

    let filter = NotificationFilter {
        method: params.method,
        path: params.path,
        user_id: params.user_id,
        since,
        offset: params.offset,
        limit: params.limit,
    };

    let notifications =
        with_connection(&state, move |conn| query_notifications(conn, &filter)).await?;
    let count = notifications.len();
    Ok(Json(NotificationsResponse {
        notifications,
        count,
    }))
}

/// Handler for `GET /api/notifications/{id}`.
pub async fn get_notification_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<StoredNotification>, Response> {
    let id: i64 = raw_id.parse().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid notification id: {}", raw_id),
        )
    })?;
    match with_connection(&state, move |conn| get_notification(conn, id)).await? {
        Some(notification) => Ok(Json(notification)),
        None => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("notification {} not found", id),
        )),
    }
}

/// Handler for `GET /api/connections`.
pub async fn list_connections_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<ConnectionsResponse> {
    let connections = state.registry().status();
    let count = connections.len();
    Json(ConnectionsResponse { connections, count })
}
