//! Session Lifecycle Integration Tests
//!
//! How the resolver rides out coordination trouble:
//! 1. Startup against an unreachable ensemble serves from the backup
//! 2. The flag file pins the backup
//! 3. Transient disconnects are invisible to callers
//! 4. Session expiry rebuilds the load balancer with the same rings

mod fixtures;

use fixtures::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wayfinder_balancer::{RequestContext, Resolver, SessionPhase};
use wayfinder_common::ClusterProperties;
use wayfinder_store::InMemoryEnsemble;

const PRIMARY: &str = "http://primary:8080/";
const BACKUP: &str = "http://backup:8080/";

async fn resolve_endpoint(resolver: &Resolver) -> String {
    resolver
        .resolve("svc://profiles/x", &RequestContext::default())
        .await
        .unwrap()
        .endpoint()
        .to_string()
}

async fn wait_for_endpoint(resolver: &Resolver, expected: &str) {
    for _ in 0..200 {
        if resolve_endpoint(resolver).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("resolver never switched to {}", expected);
}

/// Waits until all three properties of the service reached the file backup.
async fn wait_for_backup(dir: &std::path::Path) {
    let files = [
        dir.join("services").join(SERVICE),
        dir.join("clusters").join(CLUSTER),
        dir.join("uris").join(CLUSTER),
    ];
    eventually("backup write-through", || files.iter().all(|f| f.exists())).await;
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_unreachable_ensemble_falls_back_to_backup() {
    let dir = tempfile::tempdir().unwrap();
    write_backup(dir.path(), &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(BACKUP, 1.0)])).await;

    let ensemble = InMemoryEnsemble::new();
    publish_all(&ensemble, &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(PRIMARY, 1.0)]));
    ensemble.set_reachable(false);

    let resolver = resolver(&ensemble, dir.path());
    let started = Instant::now();
    resolver.start().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(resolve_endpoint(&resolver).await, BACKUP);
    assert_eq!(resolver.metrics().store_switches, 1);

    // Once the ensemble answers, the primary takes over
    ensemble.set_reachable(true);
    wait_for_endpoint(&resolver, PRIMARY).await;
    assert_eq!(resolver.phase(), SessionPhase::SyncConnected);

    resolver.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flag_file_keeps_backup() {
    let dir = tempfile::tempdir().unwrap();
    write_backup(dir.path(), &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(BACKUP, 1.0)])).await;
    let flag = dir.path().join("suppress-primary");
    std::fs::write(&flag, b"").unwrap();

    let ensemble = InMemoryEnsemble::new();
    publish_all(&ensemble, &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(PRIMARY, 1.0)]));

    let mut config = config(dir.path());
    config.flag_file = Some(flag);
    let resolver = Resolver::new(config, Arc::new(ensemble.clone()), transports());
    resolver.start().await.unwrap();

    assert_eq!(resolver.phase(), SessionPhase::SyncConnected);
    for _ in 0..10 {
        assert_eq!(resolve_endpoint(&resolver).await, BACKUP);
    }

    resolver.shutdown().await.unwrap();
}

// ============================================================================
// Transient disconnects
// ============================================================================

#[tokio::test]
async fn test_disconnect_keeps_rings() {
    let dir = tempfile::tempdir().unwrap();
    let ensemble = InMemoryEnsemble::new();
    publish_all(&ensemble, &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(PRIMARY, 1.0)]));
    let resolver = resolver(&ensemble, dir.path());
    resolver.start().await.unwrap();

    let before = resolver.rings("svc://profiles").await.unwrap();
    wait_for_backup(dir.path()).await;

    ensemble.set_reachable(false);
    eventually("disconnect", || resolver.phase() == SessionPhase::TransientDisconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let during = resolver.rings("svc://profiles").await.unwrap();
    assert!(Arc::ptr_eq(&before[&0], &during[&0]), "ring rebuilt while disconnected");
    assert_eq!(resolve_endpoint(&resolver).await, PRIMARY);

    ensemble.set_reachable(true);
    eventually("reconnect", || resolver.phase() == SessionPhase::SyncConnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = resolver.rings("svc://profiles").await.unwrap();
    assert!(Arc::ptr_eq(&before[&0], &after[&0]), "ring rebuilt after reconnect");

    resolver.shutdown().await.unwrap();
}

// ============================================================================
// Session expiry
// ============================================================================

#[tokio::test]
async fn test_expiry_rebuilds_identical_rings() {
    let dir = tempfile::tempdir().unwrap();
    let ensemble = InMemoryEnsemble::new();
    let weighted = endpoints(&[(PRIMARY, 1.0), ("http://other:8080/", 2.0)]);
    publish_all(&ensemble, &service(), &ClusterProperties::new(CLUSTER), &weighted);

    let factory = Arc::new(RecordingFactory::new(ensemble.clone()));
    let resolver = Resolver::new(config(dir.path()), factory.clone(), transports());
    resolver.start().await.unwrap();

    let before = resolver.rings("svc://profiles").await.unwrap();
    assert_eq!(before[&0].points().get(PRIMARY), Some(&100));
    assert_eq!(before[&0].points().get("http://other:8080/"), Some(&200));
    wait_for_backup(dir.path()).await;
    let first_session = resolver.session_id().unwrap();

    factory.session(0).expire_session();
    eventually("replacement session", || {
        resolver.session_id().is_some_and(|id| id != first_session)
    })
    .await;
    assert_eq!(factory.opened(), 2);

    let after = resolver.rings("svc://profiles").await.unwrap();
    assert_eq!(before.len(), after.len());
    assert_eq!(*before[&0], *after[&0]);
    assert_eq!(resolver.phase(), SessionPhase::SyncConnected);

    resolver.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expiry_reannounces_and_replays_controls() {
    let dir = tempfile::tempdir().unwrap();
    let ensemble = InMemoryEnsemble::new();
    publish_all(&ensemble, &service(), &ClusterProperties::new(CLUSTER), &endpoints(&[(PRIMARY, 1.0)]));

    let factory = Arc::new(RecordingFactory::new(ensemble.clone()));
    let resolver = Resolver::new(config(dir.path()), factory.clone(), transports());
    resolver.start().await.unwrap();

    let announced = wayfinder_common::UriProperties::new("self-cluster")
        .with_endpoint(BACKUP, wayfinder_common::EndpointProperties::default());
    resolver.announce("self-cluster", announced).await.unwrap();
    resolver.mark_down(PRIMARY).unwrap();
    let first_session = resolver.session_id().unwrap();

    factory.session(0).expire_session();
    assert!(ensemble.children("/d2/uris/self-cluster").is_empty());

    eventually("replacement session", || {
        resolver.session_id().is_some_and(|id| id != first_session)
    })
    .await;
    eventually("re-announcement", || ensemble.children("/d2/uris/self-cluster").len() == 1).await;

    // The mark-down is replayed onto the new load balancer
    resolver.run_window().await.unwrap();
    let rings = resolver.rings("svc://profiles").await.unwrap();
    assert!(rings.get(&0).is_none_or(|ring| !ring.contains(PRIMARY)));

    resolver.shutdown().await.unwrap();
}
