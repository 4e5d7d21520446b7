//! The authoritative set of live push connections.
//!
//! All state sits behind one `std::sync::RwLock`. Every acquisition is a
//! short map operation that never spans an `.await`, so a synchronous lock
//! is both safe and cheaper than an async one. The dispatcher works from
//! [`ConnectionRegistry::snapshot`] and never holds the lock while sending.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::session::PushSink;

/// Opaque identity of one accepted push session.
///
/// Ids are allocated monotonically and never reused within a process, so
/// ordering by id is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Handshake done, nothing delivered yet.
    Connected,
    /// Last send or client message succeeded.
    Active,
    /// Nothing heard from or delivered to the connection within the stale window.
    Stale,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered connection: metadata plus the sink used to reach it.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub sink: PushSink,
}

impl Connection {
    /// Metadata view without the sink.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            status: self.status,
        }
    }
}

/// Serializable connection metadata, as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ConnectionStatus,
}

/// Registry sizing and liveness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Upper bound on live connections.
    pub max_connections: usize,
    /// Silence after which a connection is reported as stale.
    pub stale_after: Duration,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Concurrency-safe registry of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    max_connections: usize,
    stale_after: TimeDelta,
}

impl ConnectionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_connections: limits.max_connections,
            stale_after: TimeDelta::from_std(limits.stale_after).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Adds a connection with status `connected`.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::ResourceExhausted` when the registry is full.
    pub fn register(&self, sink: PushSink) -> Result<ConnectionId, NotifyError> {
        let mut entries = self.write();
        if entries.len() >= self.max_connections {
            tracing::warn!(
                capacity = self.max_connections,
                "rejecting connection: registry at capacity"
            );
            return Err(NotifyError::ResourceExhausted {
                capacity: self.max_connections,
            });
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        entries.insert(
            id,
            Connection {
                id,
                connected_at: now,
                last_seen: now,
                status: ConnectionStatus::Connected,
                sink,
            },
        );
        tracing::info!(connection_id = %id, total = entries.len(), "connection registered");
        Ok(id)
    }

    /// Removes a connection. Returns whether it was present; removing an
    /// absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut entries = self.write();
        let removed = entries.remove(&id).is_some();
        if removed {
            tracing::info!(connection_id = %id, remaining = entries.len(), "connection removed");
        }
        removed
    }

    /// Refreshes `last_seen` and sets `status`. Returns whether the id was
    /// present; an id removed concurrently is silently ignored.
    pub fn touch(&self, id: ConnectionId, status: ConnectionStatus) -> bool {
        let mut entries = self.write();
        match entries.get_mut(&id) {
            Some(conn) => {
                conn.last_seen = Utc::now();
                conn.status = status;
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every connection, in registration order.
    ///
    /// Connections silent for longer than the stale window are reported as
    /// `stale`; the stored status is left untouched.
    pub fn snapshot(&self) -> Vec<Connection> {
        let now = Utc::now();
        let entries = self.read();
        entries
            .values()
            .map(|conn| {
                let mut copy = conn.clone();
                if now.signed_duration_since(copy.last_seen) > self.stale_after {
                    copy.status = ConnectionStatus::Stale;
                }
                copy
            })
            .collect()
    }

    /// Metadata for every connection, in registration order.
    pub fn status(&self) -> Vec<ConnectionInfo> {
        self.snapshot().iter().map(Connection::info).collect()
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ConnectionId, Connection>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::error!("connection registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ConnectionId, Connection>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("connection registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> PushSink {
        PushSink::channel(1).0
    }

    #[test]
    fn register_starts_connected() {
        let registry = ConnectionRegistry::default();
        let id = registry.register(sink()).expect("register");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].status, ConnectionStatus::Connected);
        assert_eq!(snapshot[0].connected_at, snapshot[0].last_seen);
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let registry = ConnectionRegistry::default();
        let a = registry.register(sink()).expect("a");
        let b = registry.register(sink()).expect("b");
        let c = registry.register(sink()).expect("c");
        assert!(a < b && b < c);

        let ids: Vec<_> = registry.snapshot().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let id = registry.register(sink()).expect("register");

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn touch_updates_status_and_last_seen() {
        let registry = ConnectionRegistry::default();
        let id = registry.register(sink()).expect("register");
        let before = registry.snapshot()[0].last_seen;

        assert!(registry.touch(id, ConnectionStatus::Active));

        let after = &registry.snapshot()[0];
        assert_eq!(after.status, ConnectionStatus::Active);
        assert!(after.last_seen >= before);
    }

    #[test]
    fn touch_on_absent_id_is_noop() {
        let registry = ConnectionRegistry::default();
        let id = registry.register(sink()).expect("register");
        registry.remove(id);

        assert!(!registry.touch(id, ConnectionStatus::Active));
        assert!(registry.is_empty(), "touch must not resurrect a removed connection");
    }

    #[test]
    fn full_registry_rejects_registration() {
        let registry = ConnectionRegistry::new(RegistryLimits {
            max_connections: 2,
            ..Default::default()
        });
        registry.register(sink()).expect("first");
        let second = registry.register(sink()).expect("second");

        let err = registry.register(sink()).expect_err("third must be rejected");
        assert!(matches!(err, NotifyError::ResourceExhausted { capacity: 2 }));

        // Freeing a slot makes room again.
        registry.remove(second);
        registry.register(sink()).expect("slot freed");
    }

    #[test]
    fn silent_connection_is_reported_stale_without_mutation() {
        let registry = ConnectionRegistry::new(RegistryLimits {
            stale_after: Duration::ZERO,
            ..Default::default()
        });
        let id = registry.register(sink()).expect("register");
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(registry.status()[0].status, ConnectionStatus::Stale);

        // Staleness is derived; the stored status is untouched.
        let stored = registry.read().get(&id).map(|c| c.status);
        assert_eq!(stored, Some(ConnectionStatus::Connected));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Active).expect("serialize");
        assert_eq!(json, "\"active\"");
        assert_eq!(ConnectionStatus::Stale.to_string(), "stale");
    }
}
