//! Advisory exclusive file locks.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use fs2::FileExt;

use crate::domain::errors::{DomainError, DomainResult};

/// Exclusive lock on a sidecar lock file, released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    /// Take the lock if nobody holds it.
    ///
    /// Returns `Ok(None)` when another handle owns the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Take the lock, retrying with exponential backoff until `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> DomainResult<Self> {
        let started = Instant::now();
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(timeout))
            .build();

        let attempt = || match Self::try_acquire(path) {
            Ok(Some(guard)) => Ok(guard),
            Ok(None) => Err(backoff::Error::transient(None)),
            Err(err) => Err(backoff::Error::permanent(Some(err))),
        };

        backoff::retry(policy, attempt).map_err(|err| match err {
            backoff::Error::Permanent(Some(io_err)) => DomainError::from(io_err),
            _ => {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(path = %path.display(), waited_ms, "lock still contended");
                DomainError::LockContention {
                    path: path.display().to_string(),
                    waited_ms,
                }
            }
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Sidecar lock path for `path`: `TASKS.md` locks through `TASKS.md.lock`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Replace `path` with `contents` through a synced temp file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(contents)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, path)
}
