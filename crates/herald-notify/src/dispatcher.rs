//! Fan-out of one record to every live connection.
//!
//! A broadcast runs in two phases. The fan-out phase sends to every
//! connection in a registry snapshot concurrently and only collects
//! outcomes. The apply phase then touches delivered connections and
//! removes failed ones, so the registry is never mutated mid-iteration and
//! no lock is held across a send.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::record::{NotificationRecord, StoredNotification};
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionStatus};

/// Time budgets for a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTimeouts {
    /// Bound on a single connection's send.
    pub per_send: Duration,
    /// Bound on the whole broadcast, independent of connection count.
    pub per_broadcast: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            per_send: Duration::from_secs(2),
            per_broadcast: Duration::from_secs(5),
        }
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// Outcome of sending one record to one connection. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub connection_id: ConnectionId,
    pub status: DeliveryStatus,
    /// Present iff `status` is `failed`.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryOutcome {
    fn delivered(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            status: DeliveryStatus::Delivered,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failed(connection_id: ConnectionId, error: &DeliveryError) -> Self {
        Self {
            connection_id,
            status: DeliveryStatus::Failed,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Delivers serialized records to every registered connection.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    timeouts: DispatchTimeouts,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, timeouts: DispatchTimeouts) -> Self {
        Self { registry, timeouts }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Serialises `record` and broadcasts it.
    ///
    /// A record that cannot be serialised yields no outcomes.
    pub async fn broadcast(&self, record: &NotificationRecord) -> Vec<DeliveryOutcome> {
        match record.to_wire() {
            Ok(message) => self.broadcast_message(message).await,
            Err(e) => {
                tracing::error!(
                    method = %record.method,
                    path = %record.path,
                    "failed to serialize notification for broadcast: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    /// Broadcasts a persisted record, row id included, so clients can
    /// acknowledge it by id.
    pub async fn broadcast_stored(&self, stored: &StoredNotification) -> Vec<DeliveryOutcome> {
        match stored.to_wire() {
            Ok(message) => self.broadcast_message(message).await,
            Err(e) => {
                tracing::error!(
                    id = stored.id,
                    "failed to serialize notification for broadcast: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    /// Sends an already-serialised message to every connection in a fresh
    /// snapshot and returns one outcome per connection.
    ///
    /// Failed connections (closed, per-send timeout, or still pending when
    /// the broadcast deadline passes) are removed from the registry. They
    /// are never retried.
    pub async fn broadcast_message(&self, message: String) -> Vec<DeliveryOutcome> {
        let targets = self.registry.snapshot();
        if targets.is_empty() {
            tracing::debug!("no live connections, nothing to broadcast");
            return Vec::new();
        }

        let deadline = Instant::now() + self.timeouts.per_broadcast;
        let per_send = self.timeouts.per_send;
        let mut pending: HashSet<ConnectionId> = targets.iter().map(|c| c.id).collect();
        let mut outcomes = Vec::with_capacity(targets.len());

        let mut sends: FuturesUnordered<_> = targets
            .into_iter()
            .map(|conn| {
                let message = message.clone();
                async move { (conn.id, conn.sink.send(message, per_send).await) }
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, sends.next()).await {
                Ok(Some((id, Ok(())))) => {
                    pending.remove(&id);
                    outcomes.push(DeliveryOutcome::delivered(id));
                }
                Ok(Some((id, Err(e)))) => {
                    pending.remove(&id);
                    tracing::warn!(connection_id = %id, "send failed, dropping connection: {}", e);
                    outcomes.push(DeliveryOutcome::failed(id, &e));
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        outstanding = pending.len(),
                        budget = ?self.timeouts.per_broadcast,
                        "broadcast deadline exceeded"
                    );
                    break;
                }
            }
        }
        drop(sends);

        for id in pending {
            outcomes.push(DeliveryOutcome::failed(id, &DeliveryError::DeadlineExceeded));
        }

        let mut delivered = 0usize;
        for outcome in &outcomes {
            match outcome.status {
                DeliveryStatus::Delivered => {
                    delivered += 1;
                    self.registry
                        .touch(outcome.connection_id, ConnectionStatus::Active);
                }
                DeliveryStatus::Failed => {
                    self.registry.remove(outcome.connection_id);
                }
            }
        }

        tracing::info!(
            delivered,
            failed = outcomes.len() - delivered,
            remaining = self.registry.len(),
            "broadcast complete"
        );

        outcomes
    }
}
