use crate::error::{DockforwardError, Result};
use crate::process::ProcessInfo;
use std::collections::BTreeSet;
use std::process::Command;
use tracing::{debug, trace};

/// Column of the NAME field (`host:port`) in `lsof -i` output.
const LSOF_NAME_FIELD: usize = 8;

/// Enumerate local listening TCP ports with `lsof -i -n -P`.
pub fn listening_ports() -> Result<BTreeSet<u16>> {
    let output = Command::new("lsof")
        .args(["-i", "-n", "-P"])
        .output()
        .map_err(|e| DockforwardError::Scan(format!("failed to run lsof: {}", e)))?;

    // lsof exits 1 when nothing matched, which is an empty result here.
    if !output.status.success() && !output.stdout.is_empty() {
        return Err(DockforwardError::Scan(format!(
            "lsof exited with {}",
            output.status
        )));
    }

    let ports = parse_listening_ports(&output.stdout);
    debug!(count = ports.len(), "local port scan complete");
    Ok(ports)
}

/// Extract the ports of `LISTEN` lines from `lsof -i -n -P` output.
///
/// ```text
/// COMMAND   PID   USER   FD   TYPE   DEVICE SIZE/OFF NODE NAME
/// node    12345   dev    22u  IPv4  0x1234      0t0  TCP 127.0.0.1:8080 (LISTEN)
/// ```
pub fn parse_listening_ports(stdout: &[u8]) -> BTreeSet<u16> {
    let stdout = String::from_utf8_lossy(stdout);
    let mut ports = BTreeSet::new();

    for line in stdout.lines().skip(1) {
        if !line.contains("LISTEN") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = fields.get(LSOF_NAME_FIELD) else {
            continue;
        };
        match name.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()) {
            Some(port) => {
                trace!(port, "found listening socket");
                ports.insert(port);
            }
            None => debug!(line, "skipping malformed lsof line"),
        }
    }

    ports
}

/// Find the process listening on `port`, including its command line.
pub fn find_listener(port: u16) -> Option<ProcessInfo> {
    let output = Command::new("lsof")
        .args(["-i", &format!(":{}", port), "-sTCP:LISTEN", "-F", "pcun"])
        .output()
        .ok()?;

    let mut info = parse_lsof_fields(&output.stdout)?;
    info.command = process_command(info.pid);

    debug!(port, pid = info.pid, process = %info.name, "found listener");
    Some(info)
}

/// Parse `lsof -F pcun` output: one field per line, tagged by its first
/// character. Only the first process set is used.
pub fn parse_lsof_fields(stdout: &[u8]) -> Option<ProcessInfo> {
    let stdout = String::from_utf8_lossy(stdout);
    let mut pid = None;
    let mut name = String::new();
    let mut user = String::new();

    for line in stdout.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        match tag {
            'p' => {
                if pid.is_some() {
                    break;
                }
                pid = Some(value.parse::<u32>().ok()?);
            }
            'c' if name.is_empty() => name = value.to_string(),
            'u' if user.is_empty() => user = value.to_string(),
            _ => {}
        }
    }

    Some(ProcessInfo {
        pid: pid?,
        name,
        user,
        command: None,
    })
}

/// Full command line of `pid`, from `/proc` where available, else `ps`.
fn process_command(pid: u32) -> Option<String> {
    if let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) {
        let cmd = cmdline_to_string(&raw);
        if !cmd.is_empty() {
            return Some(cmd);
        }
    }

    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "args="])
        .output()
        .ok()?;

    if output.status.success() {
        let cmd = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !cmd.is_empty() {
            return Some(cmd);
        }
    }
    None
}

/// `/proc/<pid>/cmdline` separates arguments with NUL bytes.
fn cmdline_to_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('\0', " ").trim().to_string()
}
