//! Filesystem mutual exclusion so two `kb-agent` process invocations never
//! write the same on-disk `ItemStore`/`StatsStore` concurrently.
//!
//! Acquire an `fslock::LockFile` first (atomic), then write a PID file for
//! diagnostics; on contention, read the PID file back to give an actionable
//! error naming the holding process.

use std::fs;
use std::path::{Path, PathBuf};

/// A lock guard that releases the lock file on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("pid_path", &self.pid_path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!(error = %e, "failed to release lock");
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            tracing::warn!(path = %self.pid_path.display(), error = %e, "failed to remove PID file");
        }
    }
}

/// Acquire the single-instance lock under `runtime_dir` (created if absent).
/// Returns a [`LockGuard`] that releases on drop.
pub fn try_acquire(runtime_dir: &Path) -> Result<LockGuard, String> {
    fs::create_dir_all(runtime_dir).map_err(|e| format!("failed to create {}: {e}", runtime_dir.display()))?;

    let lock_path = runtime_dir.join("kba.lock");
    let pid_path = runtime_dir.join("kba.pid");

    let mut lock = fslock::LockFile::open(&lock_path).map_err(|e| format!("failed to open lock file {}: {e}", lock_path.display()))?;
    let acquired = lock.try_lock().map_err(|e| format!("failed to acquire lock: {e}"))?;

    if !acquired {
        let holder_pid = fs::read_to_string(&pid_path).ok().and_then(|s| s.trim().parse::<i32>().ok());
        return match holder_pid {
            Some(pid) if is_pid_alive(pid) => Err(format!("another kb-agent instance is running (PID {pid})")),
            Some(pid) => Err(format!(
                "lock file is held but recorded PID {pid} is not alive; remove {} and {} to recover",
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!("another kb-agent instance holds the lock; if stale, remove {}", lock_path.display())),
        };
    }

    fs::write(&pid_path, std::process::id().to_string()).map_err(|e| format!("failed to write PID file: {e}"))?;
    Ok(LockGuard { lock, pid_path })
}

fn is_pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_pid_is_alive() {
        assert!(is_pid_alive(std::process::id() as i32));
    }

    #[test]
    fn arbitrary_large_pid_is_not_alive() {
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn second_acquire_in_same_directory_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let _first = try_acquire(dir.path()).unwrap();
        let second = try_acquire(dir.path());
        assert!(second.is_err());
    }

    #[test]
    fn lock_is_reacquirable_after_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _first = try_acquire(dir.path()).unwrap();
        }
        assert!(try_acquire(dir.path()).is_ok());
    }
}
