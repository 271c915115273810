// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Lock directories.
//!
//! Jobs triggered from cron or systemd timers must not overlap. The mere
//! existence of a lock directory serves as the mutex. A lock directory is
//! staged with its owner's pid inside, then renamed into place, which is
//! atomic on every Unix filesystem wrench cares about. The owner removes the
//! whole directory once the guard goes out of scope.

use std::{
    fs::{create_dir_all, read_to_string, remove_dir_all, rename, write},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

/// Lock directory at a fixed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDir {
    path: PathBuf,
}

impl LockDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Try to take the lock.
    ///
    /// Returns `None` if another live process holds it. A lock left behind by
    /// a dead process is cleared, and acquisition is retried once.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Create`] if lock directory cannot be created for
    ///   any reason other than already existing.
    /// - Return [`LockError::Remove`] if a stale lock cannot be cleared.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        match self.create() {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Held(_)) => match self.stale_pid() {
                Some(dead) => self.take_over(dead),
                None => {
                    info!("lock {} is held, another run is in progress", self.path.display());
                    Ok(None)
                }
            },
            Err(err) => Err(err),
        }
    }

    /// Clear lock of dead owner, then retry once.
    ///
    /// Several processes may find the same stale lock. Each moves whatever
    /// sits at the lock path into a private directory first, and only clears
    /// it if it still carries the dead owner's pid. Anything else is a fresh
    /// lock of a faster contender, and is moved back untouched.
    fn take_over(&self, dead: u32) -> Result<Option<LockGuard>> {
        let remove_err = |err: std::io::Error| LockError::Remove {
            source: err,
            path: self.path.clone(),
        };
        let tomb = staging_dir(self.parent(), ".wrench-stale").map_err(remove_err)?;
        let moved = tomb.path().join("lock");

        match rename(&self.path, &moved) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return self.retry(),
            Err(err) => return Err(remove_err(err)),
        }

        if read_pid(&moved) != Some(dead) {
            if let Err(err) = rename(&moved, &self.path) {
                warn!("failed to restore lock {}: {err}", self.path.display());
            }
            info!("lock {} is held, another run is in progress", self.path.display());
            return Ok(None);
        }

        warn!("cleared stale lock {} of dead pid {dead}", self.path.display());
        drop(tomb);
        self.retry()
    }

    fn retry(&self) -> Result<Option<LockGuard>> {
        match self.create() {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Held(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create(&self) -> Result<LockGuard> {
        let create_err = |err: std::io::Error| LockError::Create {
            source: err,
            path: self.path.clone(),
        };
        let parent = self.parent();
        create_dir_all(parent).map_err(create_err)?;

        // INVARIANT: Lock directory appears atomically with its pid inside,
        //   - Directory is staged next to the lock, then renamed into place.
        //   - Renaming onto an occupied lock fails, it is never empty.
        if self.path.exists() {
            return Err(LockError::Held(self.path.clone()));
        }
        let staging = staging_dir(parent, ".wrench-lock").map_err(create_err)?;
        write(staging.path().join("pid"), std::process::id().to_string()).map_err(create_err)?;
        match rename(staging.path(), &self.path) {
            Ok(()) => {}
            Err(err) if is_occupied(&err) => return Err(LockError::Held(self.path.clone())),
            Err(err) => return Err(create_err(err)),
        }
        debug!("acquired lock {}", self.path.display());

        Ok(LockGuard {
            path: self.path.clone(),
        })
    }

    fn parent(&self) -> &Path {
        self.path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    /// Pid of lock owner that is recorded but no longer running.
    ///
    /// Only decidable where `/proc` exists. Everywhere else a lock is never
    /// considered stale.
    fn stale_pid(&self) -> Option<u32> {
        let pid = read_pid(&self.path)?;
        let dead = Path::new("/proc/self").exists()
            && !Path::new("/proc").join(pid.to_string()).exists();

        dead.then_some(pid)
    }
}

fn staging_dir(parent: &Path, prefix: &str) -> std::io::Result<TempDir> {
    Builder::new().prefix(prefix).tempdir_in(parent)
}

fn read_pid(dir: &Path) -> Option<u32> {
    read_to_string(dir.join("pid")).ok()?.trim().parse().ok()
}

fn is_occupied(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::AlreadyExists || err.raw_os_error() == Some(libc::ENOTEMPTY)
}

/// Held lock. Removes lock directory on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = remove_dir_all(&self.path) {
            warn!("failed to release lock {}: {err}", self.path.display());
        } else {
            debug!("released lock {}", self.path.display());
        }
    }
}

/// Lock directory error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another process holds the lock.
    #[error("lock {:?} is held", .0.display())]
    Held(PathBuf),

    #[error("failed to create lock {:?}", path.display())]
    Create {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to remove stale lock {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = LockError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[sealed_test]
    fn second_acquire_is_refused_until_release() -> anyhow::Result<()> {
        let lock = LockDir::new("run/site.lock");

        let guard = lock.try_acquire()?;
        assert!(guard.is_some());
        assert_eq!(
            read_to_string("run/site.lock/pid")?,
            std::process::id().to_string()
        );
        assert!(lock.try_acquire()?.is_none());

        drop(guard);
        assert!(!lock.path().exists());
        assert!(lock.try_acquire()?.is_some());

        Ok(())
    }

    #[sealed_test]
    fn lock_without_pid_is_never_stale() -> anyhow::Result<()> {
        std::fs::create_dir("held.lock")?;
        let lock = LockDir::new("held.lock");
        assert!(lock.try_acquire()?.is_none());
        assert!(lock.path().exists());

        Ok(())
    }

    #[sealed_test]
    fn dead_owner_lock_is_cleared() -> anyhow::Result<()> {
        if !Path::new("/proc/self").exists() {
            return Ok(());
        }

        std::fs::create_dir("stale.lock")?;
        // Larger than any default pid_max, so never a live process.
        write("stale.lock/pid", "4194305")?;
        let lock = LockDir::new("stale.lock");
        assert!(lock.try_acquire()?.is_some());

        Ok(())
    }

    #[sealed_test]
    fn stale_lock_goes_to_one_contender() -> anyhow::Result<()> {
        if !Path::new("/proc/self").exists() {
            return Ok(());
        }

        for _ in 0..50 {
            std::fs::create_dir("race.lock")?;
            write("race.lock/pid", "4194305")?;

            let barrier = Arc::new(Barrier::new(2));
            let contenders = (0..2)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        LockDir::new("race.lock").try_acquire()
                    })
                })
                .collect::<Vec<_>>();

            let mut guards = Vec::new();
            for contender in contenders {
                let result = contender.join().map_err(|_| anyhow::anyhow!("contender panicked"))?;
                guards.extend(result?);
            }
            assert_eq!(guards.len(), 1);
            assert_eq!(
                read_to_string("race.lock/pid")?,
                std::process::id().to_string()
            );

            drop(guards);
            assert!(!Path::new("race.lock").exists());
        }

        Ok(())
    }
}
