//! Process signalling helpers

use tracing::debug;

/// Send `SIGKILL` to `pid`'s process group (falls back to the pid alone)
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    if pid <= 0 {
        return;
    }
    // SAFETY: kill(2) only reads its integer arguments
    let group = unsafe { libc::kill(-pid, signal) };
    if group != 0 {
        let single = unsafe { libc::kill(pid, signal) };
        debug!(pid, signal, group, single, "Signalled process");
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {}
