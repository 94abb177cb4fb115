//! Process supervision: state machine, bounded restart, graceful stop.

pub mod shutdown;
pub mod supervisor;
pub mod types;

pub use supervisor::Supervisor;
pub use types::{ExitOutcome, ProcessInfo, ProcessState};

use std::process::ExitStatus;

/// The signal that terminated a child, when there was one.
#[cfg(unix)]
pub(crate) fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}
