use clap::Parser;
use dockforward::cli::Cli;
use dockforward::config::{Config, ServerConfig};
use dockforward::discovery::DockerDiscovery;
use dockforward::error::Result;
use dockforward::forward::TunnelRegistry;
use dockforward::logging::init_logging;
use dockforward::model::Snapshot;
use dockforward::monitor::Monitor;
use dockforward::process::SystemProbe;
use dockforward::ssh::SshTransport;
use dockforward::sync::StateSync;
use dockforward::transport::Transport;
use dockforward::view::{render, transition, Command, Effect, ViewContext, ViewState};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = init_logging(&cli);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[instrument(name = "run", skip(cli), fields(headless = cli.headless))]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_default();

    info!("dockforward v{}", env!("CARGO_PKG_VERSION"));

    if cli.headless {
        let server = cli.resolve_server(&config);
        let engine = Engine::connect(&server, &cli).await?;
        let monitor = Monitor::new(engine.sync.clone(), cli.poll_interval())
            .with_transport(engine.transport.clone());
        let result = monitor.run().await;
        engine.transport.close().await?;
        return result;
    }

    run_interactive(cli, config).await
}

/// Everything that lives for one connection to a Docker host.
struct Engine {
    transport: Arc<SshTransport>,
    sync: Arc<StateSync>,
}

impl Engine {
    async fn connect(server: &ServerConfig, cli: &Cli) -> Result<Self> {
        let transport = Arc::new(SshTransport::connect(server).await?);
        let shared: Arc<dyn Transport> = transport.clone();

        let discovery = Arc::new(DockerDiscovery::new(shared.clone(), cli.docker_socket.clone()));
        let registry = Arc::new(TunnelRegistry::new(shared));
        let sync = Arc::new(StateSync::new(discovery, registry, Arc::new(SystemProbe::new())));

        Ok(Self { transport, sync })
    }
}

/// A connected engine with its background poll loop.
struct Connected {
    engine: Engine,
    snapshots: watch::Receiver<Snapshot>,
    stop: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

impl Connected {
    async fn start(server: &ServerConfig, cli: &Cli) -> Result<Self> {
        let engine = Engine::connect(server, cli).await?;
        let monitor = Monitor::new(engine.sync.clone(), cli.poll_interval())
            .with_transport(engine.transport.clone());
        let snapshots = monitor.subscribe();

        let (stop, stop_rx) = oneshot::channel::<()>();
        let monitor = tokio::spawn(async move {
            if let Err(e) = monitor
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
            {
                warn!("Monitor stopped: {}", e);
            }
        });

        Ok(Self {
            engine,
            snapshots,
            stop,
            monitor,
        })
    }

    async fn disconnect(self) {
        let _ = self.stop.send(());
        let _ = self.monitor.await;
        self.engine.sync.shutdown().await;
        if let Err(e) = self.engine.transport.close().await {
            warn!("Failed to close connection: {}", e);
        }
    }
}

async fn run_interactive(cli: Cli, config: Config) -> Result<()> {
    let servers = config.servers.clone();
    let mut lines = spawn_stdin_reader();
    let mut connected: Option<Connected> = None;
    let mut state = ViewState::ServerList;
    let mut snapshot = Snapshot::default();
    let mut message: Option<String> = None;

    if cli.host.is_some() || cli.server.is_some() {
        let server = cli.resolve_server(&config);
        match Connected::start(&server, &cli).await {
            Ok(c) => {
                connected = Some(c);
                state = ViewState::Overview;
            }
            Err(e) => message = Some(format!("Failed to connect to {}: {}", server.name, e)),
        }
    }

    loop {
        print!("\x1b[2J\x1b[H{}", render(&state, &servers, &snapshot));
        if let Some(msg) = &message {
            println!("\n{msg}");
        }

        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                message = None;

                let ctx = ViewContext::new(servers.len(), &snapshot, &state);
                let next = transition(&state, Command::parse(&line), &ctx);
                state = next.next;

                match next.effect {
                    Some(Effect::Exit) => break,
                    Some(Effect::Connect(index)) => {
                        if let Some(c) = connected.take() {
                            c.disconnect().await;
                        }
                        snapshot = Snapshot::default();
                        let server = &servers[index];
                        match Connected::start(server, &cli).await {
                            Ok(c) => connected = Some(c),
                            Err(e) => {
                                message = Some(format!("Failed to connect to {}: {}", server.name, e));
                                state = ViewState::ServerList;
                            }
                        }
                    }
                    Some(Effect::Disconnect) => {
                        if let Some(c) = connected.take() {
                            c.disconnect().await;
                        }
                        snapshot = Snapshot::default();
                    }
                    Some(Effect::Remap { service, remote, local }) => {
                        if let Some(c) = &connected {
                            message = Some(match c.engine.sync.remap(&service, &remote, local).await {
                                Ok(()) => format!("Remapped {service} port {remote} to local {local}"),
                                Err(e) => format!("Remap failed: {e}"),
                            });
                            snapshot = c.engine.sync.snapshot().await;
                        }
                    }
                    Some(Effect::KillAndRetake { service, remote }) => {
                        if let Some(c) = &connected {
                            message = Some(match c.engine.sync.kill_and_retake(&service, &remote).await {
                                Ok(()) => format!("Freed and forwarded {service} port {remote}"),
                                Err(e) => format!("Kill failed: {e}"),
                            });
                            snapshot = c.engine.sync.snapshot().await;
                        }
                    }
                    None => {}
                }
            }
            Some(next) = next_snapshot(&mut connected) => {
                snapshot = next;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(c) = connected.take() {
        c.disconnect().await;
    }
    Ok(())
}

/// Wait for the next published snapshot, or forever when not connected.
async fn next_snapshot(connected: &mut Option<Connected>) -> Option<Snapshot> {
    match connected {
        Some(c) => match c.snapshots.changed().await {
            Ok(()) => Some(c.snapshots.borrow_and_update().clone()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line.trim().to_string()).is_err() {
                break;
            }
        }
    });
    rx
}
