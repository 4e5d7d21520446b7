//! Concurrency tests for the connection registry and broadcast dispatcher.
//!
//! Registration, removal, and broadcasts race against each other; the
//! registry must end up consistent with no deadlock and no orphaned entry.

use herald_notify::{
    BroadcastDispatcher, ConnectionRegistry, DispatchTimeouts, NotifyError, PushSink,
    RegistryLimits,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn limits(max_connections: usize) -> RegistryLimits {
    RegistryLimits {
        max_connections,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_register_yields_unique_ids() {
    let registry = Arc::new(ConnectionRegistry::new(limits(1024)));
    let mut handles = Vec::new();

    for _ in 0..200 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            // Keep the receiver alive so the sink stays open.
            let (sink, rx) = PushSink::channel(4);
            let id = registry.register(sink).expect("capacity not reached");
            (id, rx)
        }));
    }

    let mut ids = HashSet::new();
    let mut receivers = Vec::new();
    for handle in handles {
        let (id, rx) = handle.await.expect("task should not panic");
        assert!(ids.insert(id), "duplicate id {id}");
        receivers.push(rx);
    }
    assert_eq!(registry.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_holds_under_contention() {
    let registry = Arc::new(ConnectionRegistry::new(limits(10)));
    let mut handles = Vec::new();

    for _ in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let (sink, _rx) = PushSink::channel(1);
            registry.register(sink)
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.expect("task should not panic") {
            Ok(_) => accepted += 1,
            Err(NotifyError::ResourceExhausted { capacity }) => assert_eq!(capacity, 10),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(registry.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcasts_race_with_churn_without_orphans() {
    let registry = Arc::new(ConnectionRegistry::new(limits(1024)));
    let dispatcher = BroadcastDispatcher::new(
        registry.clone(),
        DispatchTimeouts {
            per_send: Duration::from_millis(200),
            per_broadcast: Duration::from_secs(2),
        },
    );

    // Stable observers that drain their channels.
    let mut drains = Vec::new();
    for _ in 0..5 {
        let (sink, mut rx) = PushSink::channel(64);
        registry.register(sink).expect("register");
        drains.push(tokio::spawn(async move {
            let mut received = 0usize;
            while rx.recv().await.is_some() {
                received += 1;
            }
            received
        }));
    }

    let mut churn = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        churn.push(tokio::spawn(async move {
            let (sink, _rx) = PushSink::channel(1);
            let id = registry.register(sink).expect("register");
            tokio::task::yield_now().await;
            registry.remove(id);
        }));
    }

    let mut broadcasts = Vec::new();
    for i in 0..20 {
        let dispatcher = dispatcher.clone();
        broadcasts.push(tokio::spawn(async move {
            dispatcher.broadcast_message(format!("{{\"n\":{i}}}")).await
        }));
    }

    for handle in churn {
        handle.await.expect("churn task should not panic");
    }
    for handle in broadcasts {
        handle.await.expect("broadcast should not panic");
    }

    // Only the stable observers remain.
    assert_eq!(registry.len(), 5);

    for connection in registry.snapshot() {
        registry.remove(connection.id);
    }
    for drain in drains {
        assert_eq!(drain.await.expect("drain should not panic"), 20);
    }
}
