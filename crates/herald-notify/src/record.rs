//! The audited-call record and its wire representation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;

/// Method used for records that describe process lifecycle events rather
/// than HTTP calls.
pub const SYSTEM_METHOD: &str = "SYSTEM";

/// One audited API call or system event.
///
/// This is also the broadcast wire format. Optional fields are always
/// serialised, as `null` when unset, so clients can rely on a fixed schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub method: String,
    pub path: String,
    pub user_id: Option<i64>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub status_code: Option<u16>,
    pub headers: Option<BTreeMap<String, String>>,
    pub client_host: Option<String>,
    pub query_params: Option<BTreeMap<String, String>>,
    /// Assigned by the store when the record is persisted.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Creates a record with only the mandatory fields set.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            user_id: None,
            request_body: None,
            response_body: None,
            status_code: None,
            headers: None,
            client_host: None,
            query_params: None,
            timestamp: None,
        }
    }

    /// Builds the record for a process lifecycle event. `kind` becomes the
    /// path and `detail` the request body.
    pub fn system(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut record = Self::new(SYSTEM_METHOD, kind);
        record.request_body = Some(detail.into());
        record
    }

    /// Whether this record describes a lifecycle event.
    pub fn is_system(&self) -> bool {
        self.method == SYSTEM_METHOD
    }

    /// Checks that `method` and `path` are present.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Validation` naming the first empty field.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.method.trim().is_empty() {
            return Err(NotifyError::Validation("method is required".to_string()));
        }
        if self.path.trim().is_empty() {
            return Err(NotifyError::Validation("path is required".to_string()));
        }
        Ok(())
    }

    /// Serialises the record into the broadcast message.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Serialization` if JSON encoding fails.
    pub fn to_wire(&self) -> Result<String, NotifyError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A record as it exists in the store: its row id plus the record with
/// `timestamp` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNotification {
    pub id: i64,
    #[serde(flatten)]
    pub record: NotificationRecord,
}

impl StoredNotification {
    /// Serialises the stored form, row id included, as pushed to clients.
    /// Clients echo `id` back as `notification_id` when acknowledging.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Serialization` if JSON encoding fails.
    pub fn to_wire(&self) -> Result<String, NotifyError> {
        Ok(serde_json::to_string(self)?)
    }
}
