use crate::error::{DockforwardError, Result};
use crate::forward::session::{FirstBind, SessionInfo, SessionState, TunnelSession};
use crate::model::{PortSpec, Service};
use crate::transport::Transport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Owns every tunnel session, keyed by remote port.
///
/// At most one session exists per remote port. Ensuring a different local
/// port for a remote port stops the old session, and waits for its listener
/// to close, before the replacement binds.
pub struct TunnelRegistry {
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<u16, TunnelSession>>,
}

impl TunnelRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `remote_port` is forwarded from `local_port`.
    ///
    /// Returns once the new session has made its first bind attempt. A port
    /// held by another process is not an error: the session keeps retrying
    /// and the conflict detector reports the collision.
    #[instrument(skip(self))]
    pub async fn ensure(&self, remote_port: u16, local_port: u16) -> Result<()> {
        if remote_port == 0 || local_port == 0 {
            return Err(DockforwardError::InvalidPort(format!(
                "{} -> {}",
                local_port, remote_port
            )));
        }

        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&remote_port) {
            if existing.local_port == local_port && !existing.is_finished() {
                debug!("session already forwarding, nothing to do");
                return Ok(());
            }
        }

        if let Some(old) = sessions.remove(&remote_port) {
            info!(
                old_local_port = old.local_port,
                "superseding tunnel session"
            );
            old.stop().await;
        }

        if self.transport.is_closed() {
            return Err(DockforwardError::Connection(
                "transport is closed".to_string(),
            ));
        }

        let (session, first_bind) =
            TunnelSession::spawn(self.transport.clone(), remote_port, local_port);

        match first_bind.await {
            Ok(FirstBind::Bound) | Ok(FirstBind::InUse) => {
                sessions.insert(remote_port, session);
                Ok(())
            }
            Ok(FirstBind::Failed(e)) => Err(DockforwardError::Tunnel {
                port: remote_port,
                message: format!("failed to bind 127.0.0.1:{}: {}", local_port, e),
            }),
            Err(_) => Err(DockforwardError::Tunnel {
                port: remote_port,
                message: "session task exited before binding".to_string(),
            }),
        }
    }

    /// Ensure every exposed port of `service`, expanding `start-end` ranges.
    ///
    /// `explicit` maps remote port text to a local port; unmapped ports are
    /// forwarded to the same local port. Stops at the first error.
    #[instrument(skip(self, service, explicit), fields(service = %service.name))]
    pub async fn ensure_all(
        &self,
        service: &Service,
        explicit: &HashMap<String, u16>,
    ) -> Result<()> {
        for entry in &service.exposed_ports {
            for remote in PortSpec::parse(entry)?.ports() {
                let local = explicit
                    .get(&remote.to_string())
                    .copied()
                    .unwrap_or(remote);
                self.ensure(remote, local).await?;
            }
        }
        Ok(())
    }

    /// Stop the session for `remote_port`. Returns whether one existed.
    pub async fn release(&self, remote_port: u16) -> bool {
        let session = self.sessions.lock().await.remove(&remote_port);
        match session {
            Some(session) => {
                info!(remote_port, local_port = session.local_port, "releasing tunnel session");
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Wait up to `timeout` for the session of `remote_port` to bind its
    /// listener.
    pub async fn wait_bound(&self, remote_port: u16, timeout: Duration) -> bool {
        let Some(mut state) = self
            .sessions
            .lock()
            .await
            .get(&remote_port)
            .map(TunnelSession::subscribe)
        else {
            return false;
        };

        let bound = tokio::time::timeout(timeout, state.wait_for(|s| *s == SessionState::Running))
            .await
            .is_ok_and(|r| r.is_ok());
        bound
    }

    pub async fn session(&self, remote_port: u16) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .await
            .get(&remote_port)
            .map(TunnelSession::info)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .await
            .values()
            .map(TunnelSession::info)
            .collect();
        infos.sort_by_key(|i| i.remote_port);
        infos
    }

    /// Local ports held by this registry's own listeners, each with the
    /// remote port it forwards to.
    pub async fn bound_local_ports(&self) -> BTreeMap<u16, u16> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.state() == SessionState::Running)
            .map(|s| (s.local_port, s.remote_port))
            .collect()
    }

    pub async fn shutdown(&self) {
        let drained: Vec<TunnelSession> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();

        info!(count = drained.len(), "Shutting down all tunnels");
        for session in drained {
            session.stop().await;
        }
    }
}
