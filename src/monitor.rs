use crate::error::{DockforwardError, Result};
use crate::model::Snapshot;
use crate::sync::{RefreshOutcome, StateSync};
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Fixed-interval poll loop around [`StateSync::refresh`].
///
/// Every completed refresh is published on a watch channel, so any number of
/// readers see the latest snapshot. Several monitors may share one
/// `StateSync`; overlapping ticks are skipped.
pub struct Monitor {
    sync: Arc<StateSync>,
    transport: Option<Arc<dyn Transport>>,
    poll_interval: Duration,
    snapshots: watch::Sender<Snapshot>,
}

impl Monitor {
    pub fn new(sync: Arc<StateSync>, poll_interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(Snapshot::default());
        Self {
            sync,
            transport: None,
            poll_interval,
            snapshots,
        }
    }

    /// Stop polling once this transport reports it has closed.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Poll until Ctrl+C, then tear every tunnel down.
    pub async fn run(&self) -> Result<()> {
        let result = self
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("Received Ctrl+C, shutting down...");
            })
            .await;

        info!("Shutting down tunnels...");
        self.sync.shutdown().await;
        result
    }

    /// Poll until `shutdown` completes. Tunnels are left running.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Starting service monitoring (interval: {:?})", self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;

                    if self.transport.as_ref().is_some_and(|t| t.is_closed()) {
                        warn!("Connection to remote host lost");
                        return Err(DockforwardError::Connection(
                            "connection to remote host lost".to_string(),
                        ));
                    }
                }
                _ = &mut shutdown => {
                    debug!("monitor shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// One poll cycle: refresh, then publish the snapshot.
    pub async fn tick(&self) {
        match self.sync.refresh().await {
            Ok(RefreshOutcome::Updated { services }) => {
                debug!(services, "services refreshed");
                self.snapshots.send_replace(self.sync.snapshot().await);
            }
            Ok(RefreshOutcome::Skipped) => {
                debug!("previous refresh still running, tick skipped");
            }
            Err(e) => {
                warn!(%e, "refresh failed, keeping previous state");
            }
        }
    }
}
