//! Tunnel registry tests against real loopback listeners.

use crate::common::*;
use dockforward::error::DockforwardError;
use dockforward::forward::{SessionState, TunnelRegistry};
use dockforward::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn registry(transport: &Arc<LoopbackTransport>) -> TunnelRegistry {
    TunnelRegistry::new(transport.clone())
}

#[tokio::test]
async fn test_ensure_forwards_traffic() {
    let echo = EchoServer::start().await;
    let transport = LoopbackTransport::new();
    let remote = find_available_port();
    transport.route(remote, echo.port);

    let registry = registry(&transport);
    registry.ensure(remote, remote).await.unwrap();
    assert!(registry.wait_bound(remote, Duration::from_secs(2)).await);

    let reply = echo_roundtrip(remote, b"ping through the tunnel").await;
    assert_eq!(reply, b"ping through the tunnel");
    assert_eq!(transport.opened.load(Ordering::SeqCst), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let transport = LoopbackTransport::new();
    let remote = find_available_port();
    let registry = registry(&transport);

    registry.ensure(remote, remote).await.unwrap();
    registry.ensure(remote, remote).await.unwrap();

    let sessions = registry.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].local_port, remote);
    assert_eq!(sessions[0].state, SessionState::Running);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_ensure_new_local_supersedes_old_session() {
    let echo = EchoServer::start().await;
    let transport = LoopbackTransport::new();
    let remote = find_available_port();
    let new_local = find_available_port();
    transport.route(remote, echo.port);

    let registry = registry(&transport);
    registry.ensure(remote, remote).await.unwrap();
    assert!(is_port_in_use(remote));

    registry.ensure(remote, new_local).await.unwrap();
    assert!(registry.wait_bound(remote, Duration::from_secs(2)).await);

    let sessions = registry.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].local_port, new_local);
    assert!(wait_for(|| !is_port_in_use(remote), 2000).await);

    assert_eq!(echo_roundtrip(new_local, b"moved").await, b"moved");
    registry.shutdown().await;
}

#[tokio::test]
async fn test_ensure_all_expands_ranges_to_identity() {
    let base = find_available_range(3);
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let svc = dockforward::model::Service::new(
        "ranged",
        vec![format!("{}-{}", base, base + 2)],
        dockforward::model::HealthStatus::Running,
    );

    registry.ensure_all(&svc, &HashMap::new()).await.unwrap();

    let sessions = registry.sessions().await;
    let pairs: Vec<(u16, u16)> = sessions
        .iter()
        .map(|s| (s.remote_port, s.local_port))
        .collect();
    assert_eq!(
        pairs,
        vec![(base, base), (base + 1, base + 1), (base + 2, base + 2)]
    );

    registry.shutdown().await;
}

#[tokio::test]
async fn test_ensure_all_uses_explicit_mapping() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let remote = find_available_port();
    let local = find_available_port();
    let svc = service("web", &[remote]);

    let explicit = HashMap::from([(remote.to_string(), local)]);
    registry.ensure_all(&svc, &explicit).await.unwrap();

    assert_eq!(registry.session(remote).await.unwrap().local_port, local);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_ensure_all_stops_at_first_error() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let a = find_available_port();
    let b = find_available_port();
    let (first, second) = (a.min(b), a.max(b));
    let svc = service("web", &[first, second]);

    let explicit = HashMap::from([(first.to_string(), 0)]);
    let err = registry.ensure_all(&svc, &explicit).await.unwrap_err();

    assert!(matches!(err, DockforwardError::InvalidPort(_)));
    assert!(registry.session(second).await.is_none());
    assert!(!is_port_in_use(second));
}

#[tokio::test]
async fn test_busy_port_keeps_retrying_until_free() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let port = find_available_port();
    let squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

    registry.ensure(port, port).await.unwrap();
    assert_eq!(
        registry.session(port).await.unwrap().state,
        SessionState::Starting
    );
    assert!(registry.bound_local_ports().await.is_empty());

    drop(squatter);
    assert!(registry.wait_bound(port, Duration::from_secs(3)).await);
    assert_eq!(registry.bound_local_ports().await.get(&port), Some(&port));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_release_frees_local_port() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let port = find_available_port();

    registry.ensure(port, port).await.unwrap();
    assert!(is_port_in_use(port));

    assert!(registry.release(port).await);
    assert!(!registry.release(port).await);
    assert!(wait_for(|| !is_port_in_use(port), 2000).await);
    assert!(registry.sessions().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_every_session() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    let a = find_available_port();
    let b = find_available_port();

    registry.ensure(a, a).await.unwrap();
    registry.ensure(b, b).await.unwrap();
    registry.shutdown().await;

    assert!(registry.sessions().await.is_empty());
    assert!(wait_for(|| !is_port_in_use(a) && !is_port_in_use(b), 2000).await);
}

#[tokio::test]
async fn test_zero_port_rejected() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);

    let err = registry.ensure(0, 8080).await.unwrap_err();
    assert!(matches!(err, DockforwardError::InvalidPort(_)));
    let err = registry.ensure(8080, 0).await.unwrap_err();
    assert!(matches!(err, DockforwardError::InvalidPort(_)));
    assert!(registry.sessions().await.is_empty());
}

#[tokio::test]
async fn test_closed_transport_refuses_new_sessions() {
    let transport = LoopbackTransport::new();
    let registry = registry(&transport);
    transport.close().await.unwrap();

    let port = find_available_port();
    let err = registry.ensure(port, port).await.unwrap_err();
    assert!(matches!(err, DockforwardError::Connection(_)));
    assert!(!is_port_in_use(port));
}
