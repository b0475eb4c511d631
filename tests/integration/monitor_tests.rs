use crate::common::*;
use dockforward::error::DockforwardError;
use dockforward::model::ForwardStatus;
use dockforward::monitor::Monitor;
use dockforward::transport::Transport;
use std::time::Duration;

#[tokio::test]
async fn test_monitor_publishes_snapshots() {
    let h = Harness::new(vec![service("db", &[])]);
    let monitor = Monitor::new(h.sync.clone(), Duration::from_millis(20));
    let mut snapshots = monitor.subscribe();

    monitor
        .run_until(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(snapshots.has_changed().unwrap());
    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(
        snapshot.get("db").unwrap().service.forward_status,
        ForwardStatus::NotForwarded
    );
    assert!(h.source.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_monitor_tick_picks_up_new_services() {
    let h = Harness::new(vec![]);
    let monitor = Monitor::new(h.sync.clone(), Duration::from_secs(60));
    let snapshots = monitor.subscribe();

    monitor.tick().await;
    assert!(snapshots.borrow().services.is_empty());

    h.source.set(vec![service("db", &[])]);
    monitor.tick().await;
    assert!(snapshots.borrow().get("db").is_some());
}

#[tokio::test]
async fn test_monitor_stops_when_transport_closes() {
    let h = Harness::new(vec![service("db", &[])]);
    let monitor = Monitor::new(h.sync.clone(), Duration::from_millis(20))
        .with_transport(h.transport.clone());
    h.transport.close().await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        monitor.run_until(std::future::pending::<()>()),
    )
    .await
    .expect("monitor kept running on a closed transport");
    assert!(matches!(result, Err(DockforwardError::Connection(_))));
}
