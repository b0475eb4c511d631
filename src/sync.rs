//! The coordination point between discovery, the tunnel registry and the
//! local conflict detector.

use crate::conflict::compute_conflicts;
use crate::discovery::ServiceSource;
use crate::error::{DockforwardError, Result};
use crate::forward::{SessionState, TunnelRegistry};
use crate::model::{ForwardStatus, PortSpec, PortView, Service, ServiceView, Snapshot};
use crate::process::{LocalProbe, ProcessInfo};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// How long `kill_and_retake` waits for the reclaimed port to bind.
const RETAKE_BIND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { services: usize },
    /// Another refresh or a user action was still running.
    Skipped,
}

#[derive(Debug, Default)]
struct SyncState {
    services: BTreeMap<String, Service>,
    /// (service, remote port) -> local port. Survives polls.
    mappings: HashMap<(String, String), u16>,
}

impl SyncState {
    fn explicit_for(&self, service: &str) -> HashMap<String, u16> {
        self.mappings
            .iter()
            .filter(|((name, _), _)| name == service)
            .map(|((_, remote), local)| (remote.clone(), *local))
            .collect()
    }
}

pub struct StateSync {
    source: Arc<dyn ServiceSource>,
    registry: Arc<TunnelRegistry>,
    probe: Arc<dyn LocalProbe>,
    state: RwLock<SyncState>,
    /// Held for a whole refresh cycle or user action.
    cycle: Mutex<()>,
}

impl StateSync {
    pub fn new(
        source: Arc<dyn ServiceSource>,
        registry: Arc<TunnelRegistry>,
        probe: Arc<dyn LocalProbe>,
    ) -> Self {
        Self {
            source,
            registry,
            probe,
            state: RwLock::new(SyncState::default()),
            cycle: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Poll discovery, forward every exposed port and annotate conflicts.
    ///
    /// On a discovery error the previous services are kept and the error is
    /// returned. Overlapping calls are skipped, not queued.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("refresh already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let mut services = self.source.list_services().await?;

        let mappings: HashMap<String, HashMap<String, u16>> = {
            let state = self.state.read().await;
            services
                .keys()
                .map(|name| (name.clone(), state.explicit_for(name)))
                .collect()
        };

        let mut failed = BTreeSet::new();
        for (name, service) in &services {
            if service.exposed_ports.is_empty() {
                continue;
            }
            let explicit = mappings.get(name).cloned().unwrap_or_default();
            if let Err(e) = self.registry.ensure_all(service, &explicit).await {
                warn!(service = %name, %e, "failed to forward service ports");
                failed.insert(name.clone());
            }
        }

        let own = self.registry.bound_local_ports().await;
        let local = match self.scan_local_ports().await {
            Ok(ports) => Some(ports),
            Err(e) => {
                warn!(%e, "local port scan failed, conflicts not updated");
                None
            }
        };

        let mut state = self.state.write().await;
        for (name, service) in services.iter_mut() {
            if let Some(local) = &local {
                service.conflicts =
                    compute_conflicts(service, &state.explicit_for(name), local, &own);
            }
            service.forward_status = ForwardStatus::compose(
                !service.exposed_ports.is_empty(),
                failed.contains(name),
                !service.conflicts.is_empty(),
            );
        }

        let count = services.len();
        state.services = services;
        debug!(services = count, "refresh complete");
        Ok(RefreshOutcome::Updated { services: count })
    }

    /// Forward `remote` of `service` from `new_local` instead.
    ///
    /// Rejected without touching any state when the service or port is
    /// unknown, or when `new_local` is held by anything other than this
    /// remote port's own tunnel.
    #[instrument(skip(self))]
    pub async fn remap(&self, service: &str, remote: &str, new_local: u16) -> Result<()> {
        let _cycle = self.cycle.lock().await;

        let remote_port = self.validate_target(service, remote).await?;
        if new_local == 0 {
            return Err(DockforwardError::ConflictResolution(
                "local port must be between 1 and 65535".to_string(),
            ));
        }

        let listening = self.scan_local_ports().await?;
        if listening.contains(&new_local) {
            let own = self
                .registry
                .session(remote_port)
                .await
                .is_some_and(|s| s.local_port == new_local && s.state == SessionState::Running);
            if !own {
                let owner = self
                    .owner_of(new_local)
                    .await
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "an unknown process".to_string());
                return Err(DockforwardError::PortOccupied {
                    port: new_local,
                    owner,
                });
            }
        }

        let key = remote_port.to_string();
        {
            let mut state = self.state.write().await;
            state
                .mappings
                .insert((service.to_string(), key.clone()), new_local);
            if let Some(svc) = state.services.get_mut(service) {
                svc.conflicts.remove(&key);
            }
        }

        let result = self.registry.ensure(remote_port, new_local).await;
        self.mark_after_action(service, result.is_ok()).await;
        result?;

        info!(service, remote_port, new_local, "port remapped");
        Ok(())
    }

    /// Kill whatever holds the local side of `remote` and forward it again.
    #[instrument(skip(self))]
    pub async fn kill_and_retake(&self, service: &str, remote: &str) -> Result<()> {
        let _cycle = self.cycle.lock().await;

        let remote_port = self.validate_target(service, remote).await?;
        let local = self
            .get_port_mapping(service, &remote_port.to_string())
            .await
            .unwrap_or(remote_port);

        let owner = self.owner_of(local).await.ok_or_else(|| {
            DockforwardError::ConflictResolution(format!(
                "no process found listening on local port {}",
                local
            ))
        })?;

        if owner.pid == std::process::id() {
            return Err(DockforwardError::ConflictResolution(format!(
                "local port {} is held by this process",
                local
            )));
        }

        info!(port = local, pid = owner.pid, process = %owner.name, "killing conflicting process");
        let probe = self.probe.clone();
        let pid = owner.pid;
        tokio::task::spawn_blocking(move || probe.kill(pid))
            .await
            .map_err(|e| DockforwardError::ProcessKill(e.to_string()))??;

        self.registry.release(remote_port).await;
        if let Err(e) = self.registry.ensure(remote_port, local).await {
            self.mark_after_action(service, false).await;
            return Err(e);
        }

        if !self.registry.wait_bound(remote_port, RETAKE_BIND_TIMEOUT).await {
            self.mark_after_action(service, false).await;
            return Err(DockforwardError::Tunnel {
                port: remote_port,
                message: format!("local port {} still busy after killing {}", local, owner),
            });
        }

        {
            let mut state = self.state.write().await;
            if let Some(svc) = state.services.get_mut(service) {
                svc.conflicts.remove(&remote_port.to_string());
            }
        }
        self.mark_after_action(service, true).await;

        info!(service, remote_port, local, "port retaken");
        Ok(())
    }

    /// The local port `remote` of `service` is forwarded from: the explicit
    /// mapping if one exists, else the remote port itself.
    pub async fn get_port_mapping(&self, service: &str, remote: &str) -> Option<u16> {
        let remote_port = remote.trim().parse::<u16>().ok().filter(|p| *p != 0)?;
        let state = self.state.read().await;
        Some(
            state
                .mappings
                .get(&(service.to_string(), remote_port.to_string()))
                .copied()
                .unwrap_or(remote_port),
        )
    }

    /// A consistent copy of every service with its resolved ports.
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        let services = state
            .services
            .iter()
            .map(|(name, service)| {
                let explicit = state.explicit_for(name);
                let mut ports = Vec::new();
                for entry in &service.exposed_ports {
                    match PortSpec::parse(entry) {
                        Ok(spec) => {
                            for remote in spec.ports() {
                                let key = remote.to_string();
                                ports.push(PortView {
                                    local: Some(explicit.get(&key).copied().unwrap_or(remote)),
                                    conflict: service.conflicts.contains(&key),
                                    remote: key,
                                });
                            }
                        }
                        Err(_) => ports.push(PortView {
                            remote: entry.clone(),
                            local: None,
                            conflict: false,
                        }),
                    }
                }
                let view = ServiceView {
                    service: service.clone(),
                    ports,
                };
                (name.clone(), view)
            })
            .collect();
        Snapshot { services }
    }

    /// Stop every tunnel session.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn validate_target(&self, service: &str, remote: &str) -> Result<u16> {
        let state = self.state.read().await;
        let svc = state
            .services
            .get(service)
            .ok_or_else(|| DockforwardError::UnknownService(service.to_string()))?;

        let unknown = || DockforwardError::UnknownPort {
            service: service.to_string(),
            port: remote.to_string(),
        };
        let port = remote.trim().parse::<u16>().map_err(|_| unknown())?;
        if port == 0 || !svc.exposes(remote) {
            return Err(unknown());
        }
        Ok(port)
    }

    /// After a user action: `Ready` if it worked and nothing conflicts.
    async fn mark_after_action(&self, service: &str, succeeded: bool) {
        let mut state = self.state.write().await;
        if let Some(svc) = state.services.get_mut(service) {
            svc.forward_status = if !svc.conflicts.is_empty() {
                ForwardStatus::Conflict
            } else if succeeded {
                ForwardStatus::Ready
            } else {
                ForwardStatus::Error
            };
        }
    }

    async fn scan_local_ports(&self) -> Result<BTreeSet<u16>> {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.listening_ports())
            .await
            .map_err(|e| DockforwardError::Scan(e.to_string()))?
    }

    async fn owner_of(&self, port: u16) -> Option<ProcessInfo> {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || probe.owner_of(port))
            .await
            .ok()
            .flatten()
    }
}
