//! Local side of conflict detection: which ports are listening on this
//! machine, who owns them, and how to get rid of an owner.

pub mod detector;
pub mod killer;

use crate::error::Result;
use std::collections::BTreeSet;
use std::fmt;

/// Information about a process holding a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub user: String,
    /// Full invocation, when it could be read.
    pub command: Option<String>,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID: {})", self.name, self.pid)
    }
}

/// Access to the local machine's sockets and processes.
///
/// Implementations block; async callers go through `spawn_blocking`.
pub trait LocalProbe: Send + Sync + 'static {
    /// Every locally listening TCP port.
    fn listening_ports(&self) -> Result<BTreeSet<u16>>;

    /// The process listening on `port`, if one can be identified.
    fn owner_of(&self, port: u16) -> Option<ProcessInfo>;

    /// Terminate `pid`: SIGTERM, then SIGKILL if it lingers.
    fn kill(&self, pid: u32) -> Result<()>;
}

/// [`LocalProbe`] backed by `lsof`, `/proc` and signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

impl LocalProbe for SystemProbe {
    fn listening_ports(&self) -> Result<BTreeSet<u16>> {
        detector::listening_ports()
    }

    fn owner_of(&self, port: u16) -> Option<ProcessInfo> {
        detector::find_listener(port)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        killer::kill_process(pid)
    }
}
