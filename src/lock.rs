/// Single-instance locking for the credential state file
use crate::error::LockError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// RAII guard proving this process is the only agent using a state file
///
/// Refresh tokens rotate on every use, so two agents sharing one state file
/// would invalidate each other's credential. The lock lives in a sibling
/// `<state>.lock` file and is released when the guard is dropped.
pub struct InstanceLock {
    file: Option<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock for `state_path` without blocking
    ///
    /// # Example
    ///
    /// ```no_run
    /// use netatmo_influx::lock::InstanceLock;
    /// use std::path::Path;
    ///
    /// let _guard = InstanceLock::acquire(Path::new("state.json")).unwrap();
    /// // Held until `_guard` goes out of scope
    /// ```
    pub fn acquire(state_path: &Path) -> Result<Self, LockError> {
        let lock_path = Self::lock_path(state_path);

        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %lock_path.display(), "acquired instance lock");
                Ok(Self {
                    file: Some(file),
                    path: lock_path,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::AlreadyHeld(
                lock_path.display().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(state_path: &Path) -> PathBuf {
        let name = state_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        state_path.with_file_name(format!("{}.lock", name))
    }
}

impl Drop for InstanceLock {
    /// Unlock only; the file stays so every agent locks the same inode
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}
