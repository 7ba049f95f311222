//! Named mutual-exclusion scopes shared by every context that opens the same
//! store.
//!
//! Inside one process each scope is a fair (FIFO) async mutex. When a lock
//! directory is configured, holders additionally take an advisory file lock
//! so other processes are excluded too; without one the coordinator only
//! serializes callers of this process.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::FileExt;
use snafu::ResultExt;
use tokio::sync::{Mutex, MutexGuard};

use super::error::{LockFileSnafu, LockTaskSnafu, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Init,
    Read,
    Write,
}

impl LockScope {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "parley-store-init",
            Self::Read => "parley-store-read",
            Self::Write => "parley-store-write",
        }
    }
}

#[derive(Debug, Default)]
pub struct LockCoordinator {
    init: Mutex<()>,
    read: Mutex<()>,
    write: Mutex<()>,
    lock_dir: Option<PathBuf>,
    degraded_logged: AtomicBool,
}

/// Held for the duration of a critical section; releases both layers on drop.
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: Option<File>,
}

impl ScopeGuard<'_> {
    pub fn is_cross_process(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

impl LockCoordinator {
    /// Process-local exclusion only.
    pub fn in_process() -> Self {
        Self::default()
    }

    /// Process-local exclusion plus advisory file locks under `lock_dir`.
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: Some(lock_dir.into()),
            ..Self::default()
        }
    }

    pub async fn acquire(&self, scope: LockScope) -> ScopeGuard<'_> {
        let local = match scope {
            LockScope::Init => self.init.lock().await,
            LockScope::Read => self.read.lock().await,
            LockScope::Write => self.write.lock().await,
        };

        let file = match self.lock_dir.as_deref() {
            Some(dir) => match lock_scope_file(dir, scope).await {
                Ok(file) => Some(file),
                Err(error) => {
                    self.log_degraded(&error.to_string());
                    None
                }
            },
            None => None,
        };

        ScopeGuard {
            _local: local,
            file,
        }
    }

    /// Non-blocking variant: `None` when another holder already has the scope,
    /// in this process or, with a lock directory, in another one.
    pub fn try_acquire(&self, scope: LockScope) -> Option<ScopeGuard<'_>> {
        let local = match scope {
            LockScope::Init => self.init.try_lock(),
            LockScope::Read => self.read.try_lock(),
            LockScope::Write => self.write.try_lock(),
        }
        .ok()?;

        let file = match self.lock_dir.as_deref() {
            Some(dir) => match try_lock_scope_file(dir, scope) {
                Ok(Some(file)) => Some(file),
                Ok(None) => return None,
                Err(error) => {
                    self.log_degraded(&error.to_string());
                    None
                }
            },
            None => None,
        };

        Some(ScopeGuard {
            _local: local,
            file,
        })
    }

    pub async fn with_lock<T, F>(&self, scope: LockScope, critical_section: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(scope).await;
        critical_section.await
    }

    fn log_degraded(&self, reason: &str) {
        if !self.degraded_logged.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "cross-process locking unavailable ({reason}); falling back to in-process exclusion"
            );
        }
    }
}

fn open_scope_file(dir: &Path, scope: LockScope) -> StorageResult<(File, PathBuf)> {
    std::fs::create_dir_all(dir).context(LockFileSnafu {
        stage: "lock-create-directory",
        path: dir.display().to_string(),
    })?;

    let path = dir.join(format!("{}.lock", scope.name()));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .context(LockFileSnafu {
            stage: "lock-open-file",
            path: path.display().to_string(),
        })?;

    Ok((file, path))
}

fn try_lock_scope_file(dir: &Path, scope: LockScope) -> StorageResult<Option<File>> {
    let (file, path) = open_scope_file(dir, scope)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(error) if error.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(source) => Err(source).context(LockFileSnafu {
            stage: "lock-try-exclusive",
            path: path.display().to_string(),
        }),
    }
}

async fn lock_scope_file(dir: &Path, scope: LockScope) -> StorageResult<File> {
    let (file, path) = open_scope_file(dir, scope)?;

    // Blocking wait for the OS lock happens off the async workers.
    let display_path = path.display().to_string();
    tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
        .await
        .context(LockTaskSnafu {
            stage: "lock-join-worker",
        })?
        .context(LockFileSnafu {
            stage: "lock-acquire-exclusive",
            path: display_path,
        })
}
