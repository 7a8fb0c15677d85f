//! Cross-process N-slot semaphore built on advisory file locks.
//!
//! A semaphore named `pool` with N slots is N lock files
//! `.semaphore-<pool>-<slot>.lock` in the lock directory. Acquiring
//! sweeps the slots with non-blocking exclusive flocks; the winner
//! writes its pid as a holder fingerprint. Holders that died without
//! releasing are reclaimed by probing the recorded pid with signal 0.
//!
//! Advisory locks only: cooperative processes, local filesystem. Not
//! supported on NFS/CIFS. Manual cleanup: remove the lock files.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cheval_core::{ChevalError, ChevalResult};
use fs2::FileExt;
use tracing::{debug, warn};

/// File-lock based semaphore limiting concurrent operations.
#[derive(Debug)]
pub struct FlockSemaphore {
    name: String,
    max_concurrent: usize,
    lock_dir: PathBuf,
    timeout: Duration,
}

/// Held slot; releases the lock on drop.
#[derive(Debug)]
pub struct SemaphoreGuard {
    file: Option<std::fs::File>,
    name: String,
    slot: usize,
}

impl SemaphoreGuard {
    /// The acquired slot index (0-based).
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            debug!(
                name = %self.name,
                slot = self.slot,
                pid = std::process::id(),
                "semaphore released"
            );
        }
    }
}

impl FlockSemaphore {
    /// Create a semaphore over `lock_dir`.
    #[must_use]
    pub fn new(name: &str, max_concurrent: usize, lock_dir: &Path, timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            max_concurrent,
            lock_dir: lock_dir.to_path_buf(),
            timeout,
        }
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        self.lock_dir
            .join(format!(".semaphore-{}-{slot}.lock", self.name))
    }

    /// Unlink the slot file when its recorded holder pid is dead.
    fn reclaim_stale(&self, path: &Path) {
        let Ok(mut file) = std::fs::File::open(path) else {
            return;
        };
        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return;
        }
        let Ok(pid) = contents.trim().parse::<i32>() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            if kill(Pid::from_raw(pid), None).is_err() && std::fs::remove_file(path).is_ok() {
                warn!(
                    name = %self.name,
                    path = %path.display(),
                    stale_pid = pid,
                    "reclaimed stale semaphore slot"
                );
            }
        }
    }

    fn try_acquire_slot(&self, slot: usize) -> Option<SemaphoreGuard> {
        let path = self.slot_path(slot);
        self.reclaim_stale(&path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .ok()?;
        if file.try_lock_exclusive().is_err() {
            return None;
        }

        // Holder fingerprint for stale-lock detection.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        debug!(
            name = %self.name,
            slot,
            pid = std::process::id(),
            "semaphore acquired"
        );
        Some(SemaphoreGuard {
            file: Some(file),
            name: self.name.clone(),
            slot,
        })
    }

    /// Acquire a slot, sweeping with capped exponential backoff until
    /// the configured deadline.
    ///
    /// # Errors
    ///
    /// `TIMEOUT` when every slot stays held past the deadline, or
    /// `INVALID_CONFIG` when the lock directory cannot be created.
    pub async fn acquire(&self) -> ChevalResult<SemaphoreGuard> {
        std::fs::create_dir_all(&self.lock_dir).map_err(|e| {
            ChevalError::invalid_config(format!(
                "cannot create lock dir {}: {e}",
                self.lock_dir.display()
            ))
        })?;

        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            for slot in 0..self.max_concurrent {
                if let Some(guard) = self.try_acquire_slot(slot) {
                    return Ok(guard);
                }
            }

            if start.elapsed() >= self.timeout {
                return Err(ChevalError::timeout(format!(
                    "semaphore '{}': all {} slots occupied after {:.1}s",
                    self.name,
                    self.max_concurrent,
                    self.timeout.as_secs_f64()
                )));
            }

            attempt += 1;
            let delay = Duration::from_millis(100 * (1 << attempt.min(5))).min(
                Duration::from_secs(2),
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let sem = FlockSemaphore::new("pool", 2, dir.path(), Duration::from_secs(1));

        let guard = sem.acquire().await.unwrap();
        assert!(guard.slot() < 2);
        drop(guard);

        // Slot reusable after release.
        let guard = sem.acquire().await.unwrap();
        assert!(guard.slot() < 2);
    }

    #[tokio::test]
    async fn test_slots_fill_up() {
        let dir = tempfile::tempdir().unwrap();
        let sem = FlockSemaphore::new("pool", 2, dir.path(), Duration::from_millis(300));

        let _a = sem.acquire().await.unwrap();
        let _b = sem.acquire().await.unwrap();
        let err = sem.acquire().await.unwrap_err();
        assert_eq!(err.kind, cheval_core::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_release_frees_slot_for_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let sem = FlockSemaphore::new("pool", 1, dir.path(), Duration::from_secs(5));

        let guard = sem.acquire().await.unwrap();
        drop(guard);
        let guard = sem.acquire().await.unwrap();
        assert_eq!(guard.slot(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_holder_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let sem = FlockSemaphore::new("pool", 1, dir.path(), Duration::from_secs(1));

        // A pid that cannot exist holds the slot on paper, but no lock
        // is actually held, so the sweep reclaims and acquires.
        std::fs::write(
            dir.path().join(".semaphore-pool-0.lock"),
            "999999999\n",
        )
        .unwrap();

        let guard = sem.acquire().await.unwrap();
        assert_eq!(guard.slot(), 0);
    }

    #[tokio::test]
    async fn test_pid_written_as_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let sem = FlockSemaphore::new("pool", 1, dir.path(), Duration::from_secs(1));

        let _guard = sem.acquire().await.unwrap();
        let contents =
            std::fs::read_to_string(dir.path().join(".semaphore-pool-0.lock")).unwrap();
        assert_eq!(
            contents.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
    }
}
