// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-wide exclusion: one live manager per pool. An advisory flock on a
//! fixed lock file, taken at startup and dropped at shutdown.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::imageutil::ImageError;

#[derive(Debug)]
pub struct ProcessGuard {
    file: File,
    path: PathBuf,
}

impl ProcessGuard {
    /// Take the host guard or report who holds it.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim().to_string();
                let holder = if holder.is_empty() {
                    "unknown".to_string()
                } else {
                    holder
                };
                return Err(ImageError::GuardHeld(holder).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to lock {}", lock_path.display()));
            }
        }

        file.set_len(0)
            .with_context(|| format!("Failed to truncate {}", lock_path.display()))?;
        file.seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to rewind {}", lock_path.display()))?;
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("Failed to write {}", lock_path.display()))?;
        debug!("Acquired manager guard at {}", lock_path.display());

        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    /// Whether some process currently holds the guard.
    pub fn is_held(lock_path: &Path) -> Result<bool> {
        if !lock_path.exists() {
            return Ok(false);
        }
        let file = File::open(lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;
        match flock(file.as_raw_fd(), FlockArg::LockSharedNonblock) {
            Ok(()) => Ok(false),
            Err(Errno::EWOULDBLOCK) => Ok(true),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to probe {}", lock_path.display()))
            }
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("Failed to release guard at {}: {}", self.path.display(), e);
        } else {
            debug!("Released manager guard at {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("manager.lock");

        let guard = ProcessGuard::acquire(&lock_path).unwrap();
        assert!(ProcessGuard::is_held(&lock_path).unwrap());

        let err = ProcessGuard::acquire(&lock_path).unwrap_err();
        let image_err = err.downcast_ref::<ImageError>().unwrap();
        match image_err {
            ImageError::GuardHeld(holder) => {
                assert_eq!(holder, &std::process::id().to_string());
            }
            other => panic!("expected GuardHeld, got {:?}", other),
        }

        drop(guard);
        assert!(!ProcessGuard::is_held(&lock_path).unwrap());
        let _guard = ProcessGuard::acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_is_held_without_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!ProcessGuard::is_held(&dir.path().join("missing.lock")).unwrap());
    }
}
