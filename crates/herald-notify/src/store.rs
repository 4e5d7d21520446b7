//! Persistence of notification records.
//!
//! Writes go through the [`NotificationStore`] trait so the pipeline stays
//! agnostic of the storage technology; [`SqliteNotificationStore`] is the
//! implementation the server uses. Reads ([`get_notification`],
//! [`query_notifications`]) operate on a plain connection and back the
//! HTTP read endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use herald_db::DbPool;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::record::{NotificationRecord, StoredNotification};

/// Default page size for [`query_notifications`].
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Largest page [`query_notifications`] will return.
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// A durable sink for notification records.
///
/// `store` is synchronous; callers on an async runtime must run it on the
/// blocking pool. A single call must insert atomically: on `Err` nothing
/// was written.
pub trait NotificationStore: Send + Sync + 'static {
    /// Persists `record`, assigning its timestamp.
    fn store(&self, record: &NotificationRecord) -> Result<StoredNotification, StoreError>;
}

/// [`NotificationStore`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteNotificationStore {
    pool: DbPool,
}

impl SqliteNotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl NotificationStore for SqliteNotificationStore {
    fn store(&self, record: &NotificationRecord) -> Result<StoredNotification, StoreError> {
        let conn = self.pool.get()?;
        insert_notification(&conn, record)
    }
}

/// Inserts one record and returns it with `id` and `timestamp` set.
///
/// # Errors
///
/// `StoreError::Database` on SQL failure (including the empty method/path
/// CHECK constraints), `StoreError::Serialization` if a map column cannot
/// be encoded.
pub fn insert_notification(
    conn: &Connection,
    record: &NotificationRecord,
) -> Result<StoredNotification, StoreError> {
    // Stored at microsecond precision; truncate first so the returned
    // record equals what a later read decodes.
    let timestamp = Utc::now().trunc_subsecs(6);
    let headers = encode_map(record.headers.as_ref())?;
    let query_params = encode_map(record.query_params.as_ref())?;

    let id = conn.query_row(
        "INSERT INTO notifications
            (method, path, user_id, request_body, response_body, status_code,
             headers, client_host, query_params, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         RETURNING id",
        params![
            record.method,
            record.path,
            record.user_id,
            record.request_body,
            record.response_body,
            record.status_code,
            headers,
            record.client_host,
            query_params,
            format_timestamp(&timestamp),
        ],
        |row| row.get::<_, i64>(0),
    )?;

    let mut stored = record.clone();
    stored.timestamp = Some(timestamp);
    Ok(StoredNotification { id, record: stored })
}

/// Fetches one stored record by id.
///
/// # Errors
///
/// Returns `StoreError` on SQL or decode failure. A missing row is `Ok(None)`.
pub fn get_notification(conn: &Connection, id: i64) -> Result<Option<StoredNotification>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
            [id],
            RawRow::from_row,
        )
        .optional()?;
    raw.map(RawRow::decode).transpose()
}

/// Filter criteria for [`query_notifications`].
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub method: Option<String>,
    pub path: Option<String>,
    pub user_id: Option<i64>,
    /// Only records persisted at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Rows to skip (default 0).
    pub offset: Option<i64>,
    /// Page size (default [`DEFAULT_QUERY_LIMIT`], capped at [`MAX_QUERY_LIMIT`]).
    pub limit: Option<i64>,
}

/// Lists stored records, newest first.
///
/// # Errors
///
/// Returns `StoreError` on SQL or decode failure.
pub fn query_notifications(
    conn: &Connection,
    filter: &NotificationFilter,
) -> Result<Vec<StoredNotification>, StoreError> {
    // WHERE clauses and bound values are collected separately; nothing from
    // the filter is interpolated into the SQL text.
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref method) = filter.method {
        values.push(Box::new(method.clone()));
        clauses.push(format!("method = ?{}", values.len()));
    }
    if let Some(ref path) = filter.path {
        values.push(Box::new(path.clone()));
        clauses.push(format!("path = ?{}", values.len()));
    }
    if let Some(user_id) = filter.user_id {
        values.push(Box::new(user_id));
        clauses.push(format!("user_id = ?{}", values.len()));
    }
    if let Some(ref since) = filter.since {
        values.push(Box::new(format_timestamp(since)));
        clauses.push(format!("timestamp >= ?{}", values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let limit = filter
        .limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT);
    values.push(Box::new(limit));
    let limit_idx = values.len();
    values.push(Box::new(filter.offset.unwrap_or(0).max(0)));
    let offset_idx = values.len();

    let sql = format!(
        "SELECT {COLUMNS} FROM notifications
         {where_clause}
         ORDER BY id DESC
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );

    let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| &**v).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(refs.as_slice(), RawRow::from_row)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?.decode()?);
    }
    Ok(out)
}

const COLUMNS: &str = "id, method, path, user_id, request_body, response_body, status_code, \
                       headers, client_host, query_params, timestamp";

/// Column values as SQLite hands them back, before JSON and time decoding.
struct RawRow {
    id: i64,
    method: String,
    path: String,
    user_id: Option<i64>,
    request_body: Option<String>,
    response_body: Option<String>,
    status_code: Option<u16>,
    headers: Option<String>,
    client_host: Option<String>,
    query_params: Option<String>,
    timestamp: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            method: row.get(1)?,
            path: row.get(2)?,
            user_id: row.get(3)?,
            request_body: row.get(4)?,
            response_body: row.get(5)?,
            status_code: row.get(6)?,
            headers: row.get(7)?,
            client_host: row.get(8)?,
            query_params: row.get(9)?,
            timestamp: row.get(10)?,
        })
    }

    fn decode(self) -> Result<StoredNotification, StoreError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|source| StoreError::Timestamp {
                value: self.timestamp.clone(),
                source,
            })?
            .with_timezone(&Utc);

        Ok(StoredNotification {
            id: self.id,
            record: NotificationRecord {
                method: self.method,
                path: self.path,
                user_id: self.user_id,
                request_body: self.request_body,
                response_body: self.response_body,
                status_code: self.status_code,
                headers: decode_map(self.headers.as_deref())?,
                client_host: self.client_host,
                query_params: decode_map(self.query_params.as_deref())?,
                timestamp: Some(timestamp),
            },
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_map(map: Option<&BTreeMap<String, String>>) -> Result<Option<String>, StoreError> {
    map.map(serde_json::to_string).transpose().map_err(StoreError::from)
}

fn decode_map(raw: Option<&str>) -> Result<Option<BTreeMap<String, String>>, StoreError> {
    raw.map(serde_json::from_str).transpose().map_err(StoreError::from)
}
