//! Interactive view navigation.
//!
//! The view is a closed set of states. Each line of user input becomes a
//! [`Command`], and [`transition`] maps `(state, command)` onto the next
//! state plus an [`Effect`] for the caller to execute against the engine.

use crate::config::ServerConfig;
use crate::model::{Snapshot, ServiceView};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    ServerList,
    Overview,
    ServiceDetail { service: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Back,
    Select(usize),
    Remap { index: usize, local: u16 },
    Kill { index: usize },
    Quit,
    Unknown,
}

impl Command {
    /// Parse one input line: `b`, `q`, `3`, `0 kill`, `0 remap 8081` or the
    /// short form `0 8081`.
    pub fn parse(input: &str) -> Self {
        let parts: Vec<&str> = input.split_whitespace().collect();
        match parts.as_slice() {
            ["b"] | ["back"] => Self::Back,
            ["q"] | ["quit"] | ["exit"] => Self::Quit,
            [index] => index.parse().map(Self::Select).unwrap_or(Self::Unknown),
            [index, "kill"] => index
                .parse()
                .map(|index| Self::Kill { index })
                .unwrap_or(Self::Unknown),
            [index, "remap", local] | [index, local] => {
                match (index.parse(), local.parse::<u16>()) {
                    (Ok(index), Ok(local)) if local != 0 => Self::Remap { index, local },
                    _ => Self::Unknown,
                }
            }
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Connect to the server at this index of the server list.
    Connect(usize),
    Disconnect,
    Remap {
        service: String,
        remote: String,
        local: u16,
    },
    KillAndRetake {
        service: String,
        remote: String,
    },
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ViewState,
    pub effect: Option<Effect>,
}

impl Transition {
    fn stay(state: &ViewState) -> Self {
        Self {
            next: state.clone(),
            effect: None,
        }
    }

    fn to(next: ViewState, effect: Option<Effect>) -> Self {
        Self { next, effect }
    }
}

/// What the current screen lists, so indices can be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub server_count: usize,
    /// Overview order: services with ports first, each group by name.
    pub services: Vec<String>,
    /// Remote ports of the selected service, in display order.
    pub ports: Vec<String>,
}

impl ViewContext {
    pub fn new(server_count: usize, snapshot: &Snapshot, state: &ViewState) -> Self {
        let (with_ports, without_ports) = snapshot.partition_by_ports();
        let services = with_ports
            .iter()
            .chain(without_ports.iter())
            .map(|v| v.service.name.clone())
            .collect();

        let ports = match state {
            ViewState::ServiceDetail { service } => snapshot
                .get(service)
                .map(|v| v.ports.iter().map(|p| p.remote.clone()).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        Self {
            server_count,
            services,
            ports,
        }
    }
}

pub fn transition(state: &ViewState, command: Command, ctx: &ViewContext) -> Transition {
    use ViewState::*;

    match (state, command) {
        (_, Command::Quit) => Transition {
            next: state.clone(),
            effect: Some(Effect::Exit),
        },

        (ServerList, Command::Select(i)) if i < ctx.server_count => {
            Transition::to(Overview, Some(Effect::Connect(i)))
        }

        (Overview, Command::Back) => Transition::to(ServerList, Some(Effect::Disconnect)),
        (Overview, Command::Select(i)) if i < ctx.services.len() => Transition::to(
            ServiceDetail {
                service: ctx.services[i].clone(),
            },
            None,
        ),

        (ServiceDetail { .. }, Command::Back) => Transition::to(Overview, None),
        (ServiceDetail { service }, Command::Remap { index, local }) if index < ctx.ports.len() => {
            Transition::to(
                state.clone(),
                Some(Effect::Remap {
                    service: service.clone(),
                    remote: ctx.ports[index].clone(),
                    local,
                }),
            )
        }
        (ServiceDetail { service }, Command::Kill { index }) if index < ctx.ports.len() => {
            Transition::to(
                state.clone(),
                Some(Effect::KillAndRetake {
                    service: service.clone(),
                    remote: ctx.ports[index].clone(),
                }),
            )
        }

        _ => Transition::stay(state),
    }
}

/// Plain-text rendering of the current screen.
pub fn render(state: &ViewState, servers: &[ServerConfig], snapshot: &Snapshot) -> String {
    let mut out = String::new();
    match state {
        ViewState::ServerList => {
            let _ = writeln!(out, "Servers:");
            for (i, server) in servers.iter().enumerate() {
                let _ = writeln!(out, "[{i}] {} ({}@{})", server.name, server.user, server.host);
            }
            let _ = writeln!(out, "\nEnter a server number to connect, [q]uit");
        }
        ViewState::Overview => {
            let (with_ports, without_ports) = snapshot.partition_by_ports();
            let mut index = 0;
            let _ = writeln!(out, "Services with ports:");
            for view in &with_ports {
                render_service_line(&mut out, index, view);
                index += 1;
            }
            let _ = writeln!(out, "\nServices without ports:");
            for view in &without_ports {
                render_service_line(&mut out, index, view);
                index += 1;
            }
            let _ = writeln!(
                out,
                "\nEnter a service number for details, [b]ack to the server list, [q]uit"
            );
        }
        ViewState::ServiceDetail { service } => match snapshot.get(service) {
            Some(view) => {
                let _ = writeln!(
                    out,
                    "{} - {} / {}",
                    view.service.name, view.service.health, view.service.forward_status
                );
                for (i, port) in view.ports.iter().enumerate() {
                    let local = port
                        .local
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let flag = if port.conflict { "  CONFLICT" } else { "" };
                    let _ = writeln!(out, "[{i}] remote {} -> local {}{flag}", port.remote, local);
                }
                let _ = writeln!(out, "\n'<n> remap <port>' to remap, '<n> kill' to free a conflicting port, [b]ack");
            }
            None => {
                let _ = writeln!(out, "{service} is no longer running. [b]ack");
            }
        },
    }
    out
}

fn render_service_line(out: &mut String, index: usize, view: &ServiceView) {
    let ports: Vec<String> = view
        .ports
        .iter()
        .map(|p| match p.local {
            Some(local) if local.to_string() != p.remote => format!("{}->{}", local, p.remote),
            _ => p.remote.clone(),
        })
        .collect();
    let _ = writeln!(
        out,
        "[{index}] {:<24} {:<10} {:<14} {}",
        view.service.name,
        view.service.health,
        view.service.forward_status,
        ports.join(", ")
    );
}
