//! Process liveness probing, used by the catalog's lockfile protocol to
//! decide whether a `backup.pid` left behind by a previous run is stale.

use nix::sys::signal::{self, Signal};
use nix::unistd::{getpid, getppid, Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe itself failed for a reason other than "no such process"
    /// (e.g. permission denied to signal a PID now reused by another user).
    Unknown,
}

/// Zero-signal probe: does not actually send a signal, only asks the kernel
/// whether the PID is a live process this user could signal.
pub fn probe(pid: i32) -> Liveness {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => Liveness::Alive,
        Err(nix::errno::Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Unknown,
    }
}

pub fn current_pid() -> i32 {
    getpid().as_raw()
}

/// True if `pid` is this process, its parent, or its grandparent — the
/// three ancestors a lockfile can legitimately still name after a crash
/// and restart under the same process tree (e.g. a supervisor re-exec).
pub fn is_own_ancestor(pid: i32) -> bool {
    let me = getpid().as_raw();
    if pid == me {
        return true;
    }
    let parent = getppid().as_raw();
    if pid == parent {
        return true;
    }
    matches!(parent_of(parent), Some(grandparent) if pid == grandparent)
}

/// Best-effort lookup of a PID's parent via `/proc/<pid>/stat`. Returns
/// `None` off Linux or if the process has already exited.
fn parent_of(pid: i32) -> Option<i32> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields are space-separated, but field 2 (comm) is parenthesized and
    // may itself contain spaces/parens, so split after the last ')'.
    let after_comm = contents.rsplit_once(')')?.1;
    let ppid_field = after_comm.split_whitespace().nth(1)?;
    ppid_field.parse().ok()
}
