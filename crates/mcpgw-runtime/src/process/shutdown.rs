//! Signal delivery for graceful shutdown with SIGTERM to SIGKILL escalation.
//!
//! The supervisor's monitor task owns the `Child` handle, so stop paths
//! signal by pid and let the monitor observe the exit.

use std::io;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Send SIGTERM. A process that is already gone is not an error.
#[cfg(unix)]
pub fn send_term(pid: u32) -> io::Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Send SIGKILL. A process that is already gone is not an error.
#[cfg(unix)]
pub fn send_kill(pid: u32) -> io::Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
pub fn send_term(_pid: u32) -> io::Result<()> {
    // No SIGTERM equivalent; the kill path handles termination.
    Ok(())
}

#[cfg(not(unix))]
pub fn send_kill(pid: u32) -> io::Result<()> {
    Err(io::Error::other(format!(
        "cannot force-kill pid {pid} on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn signalling_a_dead_pid_is_ok() {
        // Pid numbers this large do not exist on test machines.
        assert!(send_term(u32::MAX / 2).is_ok());
        assert!(send_kill(u32::MAX / 2).is_ok());
    }
}
