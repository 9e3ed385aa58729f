//! Single-session lock for the repository.
//!
//! Two layers: an in-process atomic flag, and a PID file under the data
//! directory so a second process (CLI and tray at the same time) is refused
//! too. A lock file left behind by a dead process is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::SyncError;

/// Held for the duration of a session. Dropping it removes the lock file and
/// clears the flag, even if the session panicked.
#[derive(Debug)]
pub struct SessionLock {
    flag: Arc<AtomicBool>,
    path: PathBuf,
}

impl SessionLock {
    pub fn acquire(flag: &Arc<AtomicBool>, path: &Path) -> Result<Self, SyncError> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress {
                holder: "another session in this process".into(),
            });
        }
        // From here on the guard owns the flag; an early return releases it.
        let mut guard = FlagGuard {
            flag: flag.as_ref(),
            armed: true,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_failure(parent, e))?;
        }

        if !try_create(path)? {
            match read_pid(path) {
                Some(pid) if pid == std::process::id() || is_process_alive(pid) => {
                    return Err(SyncError::SyncInProgress {
                        holder: format!("process {}", pid),
                    });
                }
                stale => {
                    warn!(pid = ?stale, path = %path.display(), "reclaiming stale session lock");
                    fs::remove_file(path).map_err(|e| io_failure(path, e))?;
                    if !try_create(path)? {
                        return Err(SyncError::SyncInProgress {
                            holder: "a concurrent process".into(),
                        });
                    }
                }
            }
        }

        guard.armed = false;
        debug!(path = %path.display(), "session lock acquired");
        Ok(Self {
            flag: flag.clone(),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove session lock");
        }
        self.flag.store(false, Ordering::SeqCst);
        debug!("session lock released");
    }
}

/// Resets the flag when acquisition bails out halfway.
struct FlagGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Create the lock file exclusively. `Ok(false)` when it already exists.
fn try_create(path: &Path) -> Result<bool, SyncError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", std::process::id()).map_err(|e| io_failure(path, e))?;
            info!(pid = std::process::id(), path = %path.display(), "wrote session lock");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(io_failure(path, e)),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks for existence.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn io_failure(path: &Path, e: std::io::Error) -> SyncError {
    SyncError::IoFailure {
        path: path.display().to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_second_acquire_in_process_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.lock");
        let flag = Arc::new(AtomicBool::new(false));

        let lock = SessionLock::acquire(&flag, &path).unwrap();
        assert!(path.exists());
        let err = SessionLock::acquire(&flag, &path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyncInProgress);

        drop(lock);
        assert!(!path.exists());
        assert!(!flag.load(Ordering::SeqCst));
        SessionLock::acquire(&flag, &path).unwrap();
    }

    #[test]
    fn test_lock_file_held_by_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let err = SessionLock::acquire(&flag, &path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyncInProgress);
        // The flag is released when the file lock is not obtained.
        assert!(!flag.load(Ordering::SeqCst));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.lock");
        fs::write(&path, i32::MAX.to_string()).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let _lock = SessionLock::acquire(&flag, &path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.lock");
        fs::write(&path, "not a pid").unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        assert!(SessionLock::acquire(&flag, &path).is_ok());
    }
}
