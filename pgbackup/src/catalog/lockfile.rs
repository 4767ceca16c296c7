//! The `backup.pid` lockfile protocol (§4.1, §5, §8 invariant 4).
//!
//! A process-global registry of lockfile paths currently held, unlinked by
//! an at-exit hook the first time any lock is acquired — this is how the
//! engine guarantees invariant 4 ("no lockfile exists that points to a
//! non-existent PID owned by this program") even on abnormal exit.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Mutex, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::config::defaults::MAX_LOCKFILE_RETRIES;
use backup_utils::pid::{self, Liveness};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Busy,
}

fn registry() -> &'static Mutex<Vec<Utf8PathBuf>> {
    static REGISTRY: OnceLock<Mutex<Vec<Utf8PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        // First lock acquisition anywhere in the process installs the
        // at-exit cleanup via libc's own `atexit`, which cannot capture
        // state; the handler reads the same static registry the live
        // acquisitions populate.
        unsafe {
            libc::atexit(release_all_at_exit);
        }
        Mutex::new(Vec::new())
    })
}

extern "C" fn release_all_at_exit() {
    if let Some(mutex) = REGISTRY_FOR_ATEXIT.get() {
        if let Ok(mut paths) = mutex.lock() {
            for path in paths.drain(..) {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

static REGISTRY_FOR_ATEXIT: OnceLock<&'static Mutex<Vec<Utf8PathBuf>>> = OnceLock::new();

/// Attempt to acquire the lockfile at `path`, writing this process's PID.
/// Returns [`LockOutcome::Busy`] (not an error) if a live process holds
/// it.
pub fn acquire(path: &Utf8Path) -> crate::error::Result<LockOutcome> {
    let reg = registry();
    // Make sure the at-exit handler can see the same registry instance;
    // harmless to set repeatedly.
    let _ = REGISTRY_FOR_ATEXIT.set(reg);

    for attempt in 0..MAX_LOCKFILE_RETRIES {
        match create_exclusive(path) {
            Ok(()) => {
                reg.lock().unwrap().push(path.to_path_buf());
                return Ok(LockOutcome::Acquired);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match resolve_existing(path)? {
                    ExistingLock::Stale => {
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    ExistingLock::Live => return Ok(LockOutcome::Busy),
                    ExistingLock::Unknown => {
                        debug!(?path, attempt, "lockfile probe inconclusive, retrying");
                        continue;
                    }
                }
            }
            Err(e) => return Err(crate::error::EngineError::io(path, e)),
        }
    }
    warn!(?path, "exhausted lockfile retries");
    Ok(LockOutcome::Busy)
}

pub fn release(path: &Utf8Path) -> crate::error::Result<()> {
    registry().lock().unwrap().retain(|p| p != path);
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(crate::error::EngineError::io(path, e)),
    }
}

enum ExistingLock {
    Stale,
    Live,
    Unknown,
}

fn resolve_existing(path: &Utf8Path) -> crate::error::Result<ExistingLock> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ExistingLock::Stale),
        Err(e) => return Err(crate::error::EngineError::io(path, e)),
    };
    let existing_pid: i32 = match text.trim().parse() {
        Ok(p) => p,
        Err(_) => return Ok(ExistingLock::Stale),
    };

    if pid::is_own_ancestor(existing_pid) {
        return Ok(ExistingLock::Stale);
    }

    Ok(match pid::probe(existing_pid) {
        Liveness::Alive => ExistingLock::Live,
        Liveness::Dead => ExistingLock::Stale,
        Liveness::Unknown => ExistingLock::Unknown,
    })
}

fn create_exclusive(path: &Utf8Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    writeln!(file, "{}", pid::current_pid())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn acquire_then_release_cleans_up() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("backup.pid").to_string());
        assert_eq!(acquire(&path).unwrap(), LockOutcome::Acquired);
        assert!(path.exists());
        release(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn own_pid_is_stale_and_reacquired() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("backup.pid").to_string());
        std::fs::write(&path, format!("{}\n", pid::current_pid())).unwrap();
        assert_eq!(acquire(&path).unwrap(), LockOutcome::Acquired);
        release(&path).unwrap();
    }

    #[test]
    fn live_unrelated_pid_reports_busy() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("backup.pid").to_string());
        // PID 1 (init) is alive and not an ancestor of the test process.
        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(acquire(&path).unwrap(), LockOutcome::Busy);
        // A's lockfile is untouched by B's failed attempt.
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "1");
    }

    #[test]
    fn dead_unrelated_pid_is_stale() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("backup.pid").to_string());
        std::fs::write(&path, format!("{}\n", i32::MAX)).unwrap();
        assert_eq!(acquire(&path).unwrap(), LockOutcome::Acquired);
        release(&path).unwrap();
    }
}
