use crate::error::{DockforwardError, Result};
use tracing::{info, warn};

/// Ask `pid` to exit with SIGTERM; escalate to SIGKILL if it is still
/// around after ten 100 ms checks.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> Result<()> {
    use std::thread;
    use std::time::Duration;

    let pid_i32 = i32::try_from(pid)
        .map_err(|_| DockforwardError::ProcessKill(format!("PID {pid} out of range")))?;
    if pid_i32 <= 0 {
        return Err(DockforwardError::ProcessKill(format!(
            "refusing to signal PID {pid}"
        )));
    }

    info!(pid, "sending SIGTERM");
    let ret = unsafe { libc::kill(pid_i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DockforwardError::ProcessKill(format!(
            "SIGTERM failed for PID {pid}: {err}"
        )));
    }

    for _ in 0..10 {
        thread::sleep(Duration::from_millis(100));
        // A null signal fails once the pid is gone.
        let alive = unsafe { libc::kill(pid_i32, 0) };
        if alive != 0 {
            info!(pid, "process exited");
            return Ok(());
        }
    }

    warn!(pid, "process didn't exit, sending SIGKILL");
    let ret = unsafe { libc::kill(pid_i32, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DockforwardError::ProcessKill(format!(
            "SIGKILL failed for PID {pid}: {err}"
        )));
    }

    thread::sleep(Duration::from_millis(100));
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_process(pid: u32) -> Result<()> {
    warn!(pid, "process termination is not supported on this platform");
    Err(DockforwardError::ProcessKill(format!(
        "cannot terminate PID {pid} on this platform"
    )))
}
