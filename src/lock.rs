/// Cross-process guard so two supervision runs never drive startosinstall at once.
use crate::error::StartOsInstallError;
use fs2::FileExt;
use std::fs::File;
use std::path::Path;

/// Exclusive advisory lock held for the lifetime of a run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl RunLock {
    /// Take the lock at `path`, failing immediately if another run holds it.
    pub fn acquire(path: &Path) -> Result<Self, StartOsInstallError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StartOsInstallError::Locked {
                path: path.to_path_buf(),
                source: e,
            })?;

        file.try_lock_exclusive()
            .map_err(|e| StartOsInstallError::Locked {
                path: path.to_path_buf(),
                source: e,
            })?;

        tracing::debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
