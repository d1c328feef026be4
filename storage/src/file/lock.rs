use super::ensure_parent_dir;
use crate::{Result, StorageError};
use log::debug;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive ownership of a database for the lifetime of one session.
///
/// Held as a non-blocking `flock` on a sidecar lock file. The lock belongs
/// to the open file description, so a second session fails even from the
/// same process. Dropping the guard releases it.
pub struct SessionLock {
    path: PathBuf,
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl SessionLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StorageError::Io)?;

        let lock = Self::lock_file(path, file)?;
        debug!("acquired session lock {}", path.display());
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn lock_file(path: &Path, file: File) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Self {
                path: path.to_path_buf(),
                _guard: guard,
            }),
            Err((_, Errno::EAGAIN)) => Err(StorageError::Locked(path.to_path_buf())),
            Err((_, errno)) => Err(StorageError::Io(errno.into())),
        }
    }

    #[cfg(not(unix))]
    fn lock_file(path: &Path, file: File) -> Result<Self> {
        log::warn!(
            "advisory locking is unavailable on this platform; {} is single-owner by convention only",
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}
