// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A simple advisory file lock, used where state must be coordinated across
//! processes rather than threads (in-process callers should prefer a
//! `Mutex`/`RwLock` — see [`crate::repo_manager::GcCoordinator`]). On unix
//! this is a real kernel `flock(2)`; elsewhere it falls back to exclusive
//! file creation, since there is no portable non-blocking flock equivalent.

use std::path::PathBuf;
use std::time::Duration;

#[cfg(unix)]
use unix::FileLockImpl;

#[cfg(not(unix))]
use fallback::FileLockImpl;

#[derive(Debug)]
pub struct FileLock {
    imp: FileLockImpl,
}

impl FileLock {
    /// Retries with a short backoff until the lock is acquired or `timeout`
    /// elapses, in which case `None` is returned.
    pub fn try_lock(path: PathBuf, timeout: Duration) -> Option<FileLock> {
        FileLockImpl::try_lock(path, timeout).map(|imp| FileLock { imp })
    }

    pub fn lock(path: PathBuf) -> FileLock {
        Self::try_lock(path, Duration::from_secs(10)).expect("failed to acquire lock file")
    }
}

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    use rustix::fs::FlockOperation;

    #[derive(Debug)]
    pub(super) struct FileLockImpl {
        path: PathBuf,
        file: File,
    }

    impl FileLockImpl {
        pub(super) fn try_lock(path: PathBuf, timeout: Duration) -> Option<FileLockImpl> {
            let file = File::create(&path).ok()?;
            let deadline = Instant::now() + timeout;
            let mut wait = Duration::from_millis(1);
            loop {
                match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
                    Ok(()) => return Some(FileLockImpl { path, file }),
                    Err(_) => {
                        if Instant::now() >= deadline {
                            return None;
                        }
                        thread::sleep(wait);
                        wait = (wait * 2).min(Duration::from_millis(200));
                    }
                }
            }
        }
    }

    impl Drop for FileLockImpl {
        fn drop(&mut self) {
            let _ = rustix::fs::flock(&self.file, FlockOperation::Unlock);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    pub(super) struct FileLockImpl {
        path: PathBuf,
    }

    impl FileLockImpl {
        pub(super) fn try_lock(path: PathBuf, timeout: Duration) -> Option<FileLockImpl> {
            let deadline = Instant::now() + timeout;
            let mut wait = Duration::from_millis(1);
            loop {
                let mut options = OpenOptions::new();
                options.create_new(true).write(true);
                match options.open(&path) {
                    Ok(_file) => return Some(FileLockImpl { path }),
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                        if Instant::now() >= deadline {
                            return None;
                        }
                        thread::sleep(wait);
                        wait = (wait * 2).min(Duration::from_millis(200));
                    }
                    Err(_) => return None,
                }
            }
        }
    }

    impl Drop for FileLockImpl {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_basic() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");
        assert!(!lock_path.exists());
        {
            let _lock = FileLock::lock(lock_path.clone());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_lock_waits_for_first_to_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");
        let first = FileLock::lock(lock_path.clone());
        assert!(FileLock::try_lock(lock_path.clone(), Duration::from_millis(50)).is_none());
        drop(first);
        assert!(FileLock::try_lock(lock_path, Duration::from_millis(50)).is_some());
    }
}
