//! Common test utilities and helpers
#![allow(dead_code)]

use async_trait::async_trait;
use dockforward::discovery::ServiceSource;
use dockforward::error::{DockforwardError, Result};
use dockforward::forward::TunnelRegistry;
use dockforward::model::{HealthStatus, Service};
use dockforward::process::{LocalProbe, ProcessInfo};
use dockforward::sync::StateSync;
use dockforward::transport::{ByteStream, Transport};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Find an available TCP port for testing
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    listener.local_addr().unwrap().port()
}

/// Check if a port is in use
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind(format!("127.0.0.1:{}", port)).is_err()
}

/// Wait for a condition to be true, with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }

    false
}

/// Simple echo TCP server standing in for a container port
pub struct EchoServer {
    pub port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind echo server");
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        Self { port, task }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Transport whose "remote host" is this machine: `open_tcp` dials
/// `127.0.0.1`, optionally redirected through `port_map`.
#[derive(Default)]
pub struct LoopbackTransport {
    pub port_map: Mutex<HashMap<u16, u16>>,
    pub opened: AtomicUsize,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route remote `port` to a real local `target` port.
    pub fn route(&self, port: u16, target: u16) {
        self.port_map.lock().unwrap().insert(port, target);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_socket(&self, path: &str) -> Result<ByteStream> {
        Err(DockforwardError::Channel(format!("no socket at {}", path)))
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<ByteStream> {
        if self.is_closed() {
            return Err(DockforwardError::Channel("transport closed".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let target = self.port_map.lock().unwrap().get(&port).copied().unwrap_or(port);
        let stream = tokio::net::TcpStream::connect((host, target)).await?;
        Ok(Box::new(stream))
    }

    async fn exec(&self, _command: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Discovery returning whatever the test put in it.
#[derive(Default)]
pub struct StaticSource {
    services: Mutex<Option<BTreeMap<String, Service>>>,
    pub calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(services: Vec<Service>) -> Arc<Self> {
        let source = Self::default();
        source.set(services);
        Arc::new(source)
    }

    pub fn set(&self, services: Vec<Service>) {
        let map = services.into_iter().map(|s| (s.name.clone(), s)).collect();
        *self.services.lock().unwrap() = Some(map);
    }

    /// Make every following `list_services` call fail.
    pub fn fail(&self) {
        *self.services.lock().unwrap() = None;
    }
}

#[async_trait]
impl ServiceSource for StaticSource {
    async fn list_services(&self) -> Result<BTreeMap<String, Service>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.services
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DockforwardError::Discovery("daemon unreachable".into()))
    }
}

/// A foreign process holding a local port, simulated by a listener the
/// probe owns.
pub struct ForeignListener {
    pub info: ProcessInfo,
    listener: Option<TcpListener>,
}

/// Local probe over real loopback sockets. Ports are reported listening when
/// a bind on them fails; foreign owners are registered by the test and
/// "killed" by dropping their listener.
#[derive(Default)]
pub struct FakeProbe {
    foreign: Mutex<HashMap<u16, ForeignListener>>,
    pub killed: Mutex<Vec<u32>>,
    /// Ports to report as listening, checked on each scan.
    pub watched: Mutex<BTreeSet<u16>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn watch(&self, port: u16) {
        self.watched.lock().unwrap().insert(port);
    }

    /// Occupy `port` with a foreign "process".
    pub fn occupy(&self, port: u16, pid: u32, name: &str) {
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("occupy port");
        self.watch(port);
        self.foreign.lock().unwrap().insert(
            port,
            ForeignListener {
                info: ProcessInfo {
                    pid,
                    name: name.to_string(),
                    user: "tester".to_string(),
                    command: Some(format!("{} --port {}", name, port)),
                },
                listener: Some(listener),
            },
        );
    }
}

impl LocalProbe for FakeProbe {
    fn listening_ports(&self) -> Result<BTreeSet<u16>> {
        let watched = self.watched.lock().unwrap().clone();
        Ok(watched.into_iter().filter(|p| is_port_in_use(*p)).collect())
    }

    fn owner_of(&self, port: u16) -> Option<ProcessInfo> {
        self.foreign
            .lock()
            .unwrap()
            .get(&port)
            .filter(|f| f.listener.is_some())
            .map(|f| f.info.clone())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let mut foreign = self.foreign.lock().unwrap();
        let entry = foreign
            .values_mut()
            .find(|f| f.info.pid == pid && f.listener.is_some())
            .ok_or_else(|| DockforwardError::ProcessKill(format!("no such process {}", pid)))?;
        entry.listener = None;
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

pub fn service(name: &str, ports: &[u16]) -> Service {
    Service::new(
        name,
        ports.iter().map(|p| p.to_string()).collect(),
        HealthStatus::Running,
    )
}

/// A full engine over fakes.
pub struct Harness {
    pub transport: Arc<LoopbackTransport>,
    pub source: Arc<StaticSource>,
    pub probe: Arc<FakeProbe>,
    pub registry: Arc<TunnelRegistry>,
    pub sync: Arc<StateSync>,
}

impl Harness {
    pub fn new(services: Vec<Service>) -> Self {
        let transport = LoopbackTransport::new();
        let source = StaticSource::new(services);
        let probe = FakeProbe::new();
        let registry = Arc::new(TunnelRegistry::new(transport.clone()));
        let sync = Arc::new(StateSync::new(
            source.clone(),
            registry.clone(),
            probe.clone(),
        ));
        Self {
            transport,
            source,
            probe,
            registry,
            sync,
        }
    }
}

/// Find `len` consecutive free ports, returning the first.
pub fn find_available_range(len: u16) -> u16 {
    for _ in 0..100 {
        let base = find_available_port();
        if base.checked_add(len).is_none() {
            continue;
        }
        if (base..base + len).all(|p| !is_port_in_use(p)) {
            return base;
        }
    }
    panic!("no run of {} free ports found", len);
}

/// Write `payload` through 127.0.0.1:`port` and read the echo back.
pub async fn echo_roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to forwarded port");
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(std::time::Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}
