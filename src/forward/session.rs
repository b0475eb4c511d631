use crate::error::Result;
use crate::transport::Transport;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Delay between bind attempts while the local port is held by someone else.
pub(crate) const RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Binding the local listener.
    Starting,
    /// Listener bound, accepting connections.
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Point-in-time description of one tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub remote_port: u16,
    pub local_port: u16,
    pub state: SessionState,
}

/// Result of a session's very first bind attempt.
#[derive(Debug)]
pub(crate) enum FirstBind {
    Bound,
    InUse,
    Failed(io::Error),
}

/// A background task forwarding `127.0.0.1:local_port` to `remote_port` on
/// the far side of the transport.
///
/// Dropping the session aborts its task; [`TunnelSession::stop`] does the same
/// cooperatively and waits until the listener is released.
pub(crate) struct TunnelSession {
    pub remote_port: u16,
    pub local_port: u16,
    state: watch::Receiver<SessionState>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TunnelSession {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        remote_port: u16,
        local_port: u16,
    ) -> (Self, oneshot::Receiver<FirstBind>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let (first_tx, first_rx) = oneshot::channel();

        let task = tokio::spawn(run_session(
            transport,
            remote_port,
            local_port,
            state_tx,
            stop_rx,
            first_tx,
        ));

        let session = Self {
            remote_port,
            local_port,
            state: state_rx,
            stop_tx: Some(stop_tx),
            task,
        };
        (session, first_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            remote_port: self.remote_port,
            local_port: self.local_port,
            state: self.state(),
        }
    }

    /// Whether the background task has exited (only after a fatal bind error).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Signal the task to stop and wait until it has released the port.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                error!(
                    remote_port = self.remote_port,
                    local_port = self.local_port,
                    %e,
                    "tunnel task panicked"
                );
            }
        }
        debug!(
            remote_port = self.remote_port,
            local_port = self.local_port,
            "tunnel session stopped"
        );
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_session(
    transport: Arc<dyn Transport>,
    remote_port: u16,
    local_port: u16,
    state_tx: watch::Sender<SessionState>,
    mut stop_rx: oneshot::Receiver<()>,
    first_tx: oneshot::Sender<FirstBind>,
) {
    let addr: SocketAddr = ([127, 0, 0, 1], local_port).into();
    let mut first_tx = Some(first_tx);

    loop {
        state_tx.send_replace(SessionState::Starting);

        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    state_tx.send_replace(SessionState::Running);
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(FirstBind::Bound);
                    }
                    break listener;
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if let Some(tx) = first_tx.take() {
                        warn!(remote_port, local_port, "local port in use, waiting for it to free up");
                        let _ = tx.send(FirstBind::InUse);
                    }
                    debug!(remote_port, local_port, "local port still in use, retrying...");
                }
                Err(e) => {
                    if let Some(tx) = first_tx.take() {
                        error!(remote_port, local_port, %e, "failed to bind local port");
                        let _ = tx.send(FirstBind::Failed(e));
                        return;
                    }
                    warn!(remote_port, local_port, %e, "failed to rebind local port, retrying...");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)) => {}
                _ = &mut stop_rx => return,
            }
        };

        info!("Forwarding localhost:{} -> remote:{}", local_port, remote_port);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(local_port, %peer, "accepted local TCP connection");
                            let transport = transport.clone();
                            connections.spawn(async move {
                                if let Err(e) = forward_connection(transport, stream, remote_port).await {
                                    debug!(remote_port, %e, "TCP connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(remote_port, local_port, %e, "TCP accept error, restarting session");
                            break;
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut stop_rx => {
                    debug!(remote_port, local_port, "shutting down TCP tunnel");
                    return;
                }
            }
        }
    }
}

/// Pipe one accepted local connection to the remote port.
async fn forward_connection(
    transport: Arc<dyn Transport>,
    mut local: TcpStream,
    remote_port: u16,
) -> Result<()> {
    let _ = local.set_nodelay(true);
    let mut remote = transport.open_tcp("127.0.0.1", remote_port).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    debug!(remote_port, bytes_up = up, bytes_down = down, "TCP connection closed");
    Ok(())
}
