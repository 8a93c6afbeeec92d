//! Single-writer lock per world directory.
//!
//! The lock is a file, `<world>/session.lock`, holding the decimal PID of the
//! process allowed to write the world. A lock left behind by a process that
//! no longer exists is stale and gets cleared; a malformed one is cleared too.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

pub const LOCK_FILE: &str = "session.lock";

/// What the lock file says about a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHolder {
    Free,
    Us,
    Other(u32),
}

pub struct WorldLockService {
    pid: u32,
    ignore_locks: bool,
    guard: Mutex<()>,
}

impl WorldLockService {
    pub fn new(ignore_locks: bool) -> Self {
        Self::with_pid(std::process::id(), ignore_locks)
    }

    /// A service acting on behalf of `pid` rather than this process.
    pub fn with_pid(pid: u32, ignore_locks: bool) -> Self {
        Self {
            pid,
            ignore_locks,
            guard: Mutex::new(()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn lock_path(world: &Path) -> PathBuf {
        world.join(LOCK_FILE)
    }

    /// Whether this process may write `world`. Clears malformed and stale
    /// lock files along the way.
    pub fn can_write(&self, world: &Path) -> bool {
        let _held = self.guard.lock().expect("world lock service poisoned");
        self.can_write_locked(world)
    }

    fn can_write_locked(&self, world: &Path) -> bool {
        if self.ignore_locks {
            return true;
        }
        match self.holder(world) {
            Ok(LockHolder::Free | LockHolder::Us) => true,
            Ok(LockHolder::Other(pid)) => {
                tracing::debug!("World {} is locked by process {}", world.display(), pid);
                false
            }
            Err(e) => {
                tracing::error!("Cannot read lock for {}: {}", world.display(), e);
                false
            }
        }
    }

    /// Read the lock file, clearing it when it is malformed or stale.
    fn holder(&self, world: &Path) -> io::Result<LockHolder> {
        let path = Self::lock_path(world);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockHolder::Free),
            Err(e) => return Err(e),
        };

        let Ok(pid) = text.trim().parse::<u32>() else {
            tracing::warn!("Removing malformed lock file {}", path.display());
            remove_quietly(&path);
            return Ok(LockHolder::Free);
        };
        if pid == self.pid {
            return Ok(LockHolder::Us);
        }
        if !process_alive(pid) {
            tracing::warn!(
                "Removing stale lock on {} left by process {}",
                world.display(),
                pid
            );
            remove_quietly(&path);
            return Ok(LockHolder::Free);
        }
        Ok(LockHolder::Other(pid))
    }

    /// Take the lock. `Ok(false)` when another live process holds it.
    pub fn acquire(&self, world: &Path) -> Result<bool> {
        let _held = self.guard.lock().expect("world lock service poisoned");
        if !self.can_write_locked(world) {
            return Ok(false);
        }
        if self.ignore_locks {
            tracing::warn!("Ignoring world lock for {}", world.display());
            return Ok(true);
        }
        fs::create_dir_all(world)
            .with_context(|| format!("creating world directory {}", world.display()))?;
        let path = Self::lock_path(world);
        fs::write(&path, self.pid.to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("Locked world {} (pid {})", world.display(), self.pid);
        Ok(true)
    }

    /// Give the lock back. Only a lock holding our PID is removed; returns
    /// whether it was.
    pub fn release(&self, world: &Path) -> Result<bool> {
        let _held = self.guard.lock().expect("world lock service poisoned");
        if self.ignore_locks {
            return Ok(true);
        }
        let path = Self::lock_path(world);
        let ours = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u32>().ok() == Some(self.pid),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if !ours {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        tracing::info!("Released world lock on {}", world.display());
        Ok(true)
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Best-effort liveness check. Where it cannot be determined the process is
/// assumed alive, so a lock is never stolen by accident; such a lock must be
/// cleared by hand or bypassed with `--ignore-lock`.
///
/// Only Linux answers this without a subprocess. Other unix systems ask
/// `ps`, and everything else always reports alive.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
    // `ps -p` also sees processes of other users, unlike `kill -0`.
    match std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::warn!("Cannot tell whether pid {} is alive ({}); treating its lock as held", pid, e);
            true
        }
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEAD_PID: u32 = 999_999_999;

    fn write_lock(world: &Path, text: &str) {
        fs::write(WorldLockService::lock_path(world), text).unwrap();
    }

    #[test]
    fn free_world_is_writable_and_acquire_writes_our_pid() {
        let dir = tempfile::tempdir().unwrap();
        let locks = WorldLockService::new(false);
        assert!(locks.can_write(dir.path()));
        assert!(locks.acquire(dir.path()).unwrap());
        let text = fs::read_to_string(WorldLockService::lock_path(dir.path())).unwrap();
        assert_eq!(text, std::process::id().to_string());
        // Our own lock keeps the world writable.
        assert!(locks.can_write(dir.path()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_foreign_pid_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        // Pid 1 always exists on Linux.
        write_lock(dir.path(), "1");
        let locks = WorldLockService::new(false);
        assert!(!locks.can_write(dir.path()));
        assert!(!locks.acquire(dir.path()).unwrap());
        assert!(!locks.release(dir.path()).unwrap());
        assert!(WorldLockService::lock_path(dir.path()).exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(dir.path(), &DEAD_PID.to_string());
        let locks = WorldLockService::new(false);
        assert!(locks.can_write(dir.path()));
        assert!(!WorldLockService::lock_path(dir.path()).exists());
    }

    #[test]
    fn malformed_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(dir.path(), "not a pid\n");
        let locks = WorldLockService::new(false);
        assert!(locks.can_write(dir.path()));
        assert!(!WorldLockService::lock_path(dir.path()).exists());
    }

    #[test]
    fn release_only_removes_our_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ours = WorldLockService::new(false);
        assert!(!ours.release(dir.path()).unwrap());
        assert!(ours.acquire(dir.path()).unwrap());

        let other = WorldLockService::with_pid(DEAD_PID, false);
        assert!(!other.release(dir.path()).unwrap());
        assert!(ours.release(dir.path()).unwrap());
        assert!(!WorldLockService::lock_path(dir.path()).exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn override_never_touches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(dir.path(), "1");
        let locks = WorldLockService::new(true);
        assert!(locks.can_write(dir.path()));
        assert!(locks.acquire(dir.path()).unwrap());
        assert!(locks.release(dir.path()).unwrap());
        assert_eq!(
            fs::read_to_string(WorldLockService::lock_path(dir.path())).unwrap(),
            "1"
        );
    }

    #[cfg(unix)]
    #[test]
    fn liveness_check() {
        assert!(process_alive(std::process::id()));
        assert!(process_alive(1));
        assert!(!process_alive(DEAD_PID));
    }
}
