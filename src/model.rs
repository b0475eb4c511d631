//! Normalized service model shared by discovery, the tunnel registry and the
//! state synchronizer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{DockforwardError, Result};

/// Container health, derived from the daemon's raw state and status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    Running,
    Restarting,
    Created,
    Removing,
    Paused,
    Exited,
    Dead,
    Unknown,
}

impl HealthStatus {
    /// Map a container's `State` and `Status` fields onto a health value.
    pub fn from_container(state: &str, status: &str) -> Self {
        match state {
            "running" => {
                // "unhealthy" contains "healthy", so order matters here.
                if status.contains("unhealthy") {
                    Self::Unhealthy
                } else if status.contains("health: starting") {
                    Self::Starting
                } else if status.contains("healthy") {
                    Self::Healthy
                } else {
                    Self::Running
                }
            }
            "created" => Self::Created,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "Healthy",
            Self::Unhealthy => "Unhealthy",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Restarting => "Restarting",
            Self::Created => "Created",
            Self::Removing => "Removing",
            Self::Paused => "Paused",
            Self::Exited => "Exited",
            Self::Dead => "Dead",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Tunnel health summarised across all exposed ports of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardStatus {
    #[default]
    NotForwarded,
    Forwarded,
    Ready,
    Error,
    Conflict,
}

impl ForwardStatus {
    /// Compose a service status from its per-port outcomes.
    ///
    /// Conflict beats Error, Error beats Forwarded, and a service without
    /// exposed ports is NotForwarded.
    pub fn compose(has_ports: bool, any_failed: bool, any_conflict: bool) -> Self {
        if any_conflict {
            Self::Conflict
        } else if any_failed {
            Self::Error
        } else if has_ports {
            Self::Forwarded
        } else {
            Self::NotForwarded
        }
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotForwarded => "Not forwarded",
            Self::Forwarded => "Forwarded",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::Conflict => "Conflict",
        };
        f.write_str(s)
    }
}

/// One entry of a service's exposed-port list: a single port or an
/// inclusive `start-end` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let parse_one = |s: &str| {
            s.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| DockforwardError::InvalidPort(text.to_string()))
        };

        match text.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_one(start)?, parse_one(end)?);
                if start > end {
                    return Err(DockforwardError::InvalidPort(text.to_string()));
                }
                Ok(Self::Range(start, end))
            }
            None => Ok(Self::Single(parse_one(text)?)),
        }
    }

    /// Expand into individual port numbers, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        match *self {
            Self::Single(p) => vec![p],
            Self::Range(start, end) => (start..=end).collect(),
        }
    }

    /// First port of the entry, used for numeric ordering.
    fn start(&self) -> u16 {
        match *self {
            Self::Single(p) | Self::Range(p, _) => p,
        }
    }
}

/// Deduplicate and numerically sort exposed-port strings. Entries that do
/// not parse sort last, in lexical order.
pub fn normalize_ports<I: IntoIterator<Item = String>>(ports: I) -> Vec<String> {
    let mut ports: Vec<String> = ports
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    ports.sort_by_key(|p| match PortSpec::parse(p) {
        Ok(spec) => (0, spec.start(), p.clone()),
        Err(_) => (1, 0, p.clone()),
    });
    ports
}

/// A remote container as seen by one discovery poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub exposed_ports: Vec<String>,
    pub health: HealthStatus,
    pub forward_status: ForwardStatus,
    pub conflicts: BTreeSet<String>,
}

impl Service {
    pub fn new(name: impl Into<String>, exposed_ports: Vec<String>, health: HealthStatus) -> Self {
        Self {
            name: name.into(),
            exposed_ports: normalize_ports(exposed_ports),
            health,
            forward_status: ForwardStatus::NotForwarded,
            conflicts: BTreeSet::new(),
        }
    }

    /// Whether `remote_port` is exposed by this service, directly or as a
    /// member of a range entry.
    pub fn exposes(&self, remote_port: &str) -> bool {
        let Ok(wanted) = remote_port.trim().parse::<u16>() else {
            return self.exposed_ports.iter().any(|p| p == remote_port);
        };
        self.exposed_ports.iter().any(|entry| match PortSpec::parse(entry) {
            Ok(PortSpec::Single(p)) => p == wanted,
            Ok(PortSpec::Range(start, end)) => (start..=end).contains(&wanted),
            Err(_) => false,
        })
    }
}

/// One exposed port in the read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortView {
    pub remote: String,
    pub local: Option<u16>,
    pub conflict: bool,
}

/// A service together with its resolved port mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub service: Service,
    pub ports: Vec<PortView>,
}

/// Merged, read-only view handed to consumers after a refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub services: BTreeMap<String, ServiceView>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&ServiceView> {
        self.services.get(name)
    }

    /// Services split by whether they expose any ports, each sorted by name.
    pub fn partition_by_ports(&self) -> (Vec<&ServiceView>, Vec<&ServiceView>) {
        self.services
            .values()
            .partition(|view| !view.service.exposed_ports.is_empty())
    }
}
