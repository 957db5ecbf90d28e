/// Errors raised anywhere along the supervision chain.
///
/// Every variant renders as a human-readable message; the outermost
/// boundary (`runner::startosinstall`) logs it and turns it into `false`.
use std::path::PathBuf;

#[derive(Debug)]
pub enum StartOsInstallError {
    /// The input path does not carry a recognised disk image extension.
    InvalidVolume { path: PathBuf },
    /// The mount tool failed outright.
    Mount { path: PathBuf, detail: String },
    /// The mount tool succeeded but reported no mounted filesystems.
    NoMountpoints { path: PathBuf },
    /// No entry on the mounted volume contains the installer executable.
    BundleNotFound { path: PathBuf },
    /// Failed to spawn the installer (or its wrapper).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed to read from or wait on the installer.
    Io { source: std::io::Error },
    /// The installer exited non-zero.
    Failed { return_code: i32 },
    /// The installer produced no output for too long and was killed.
    TimedOut { secs: u64, return_code: i32 },
    /// A handshake handler is already installed in this process.
    HandlerInstalled,
    /// Another supervision run holds the run lock.
    Locked {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StartOsInstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOsInstallError::InvalidVolume { path } => {
                write!(f, "{} doesn't appear to be a disk image", path.display())
            }
            StartOsInstallError::Mount { path, detail } => {
                write!(f, "failed to mount {}: {detail}", path.display())
            }
            StartOsInstallError::NoMountpoints { path } => {
                write!(f, "No filesystems mounted from {}", path.display())
            }
            StartOsInstallError::BundleNotFound { path } => {
                write!(f, "Valid Install macOS.app not found on {}", path.display())
            }
            StartOsInstallError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            StartOsInstallError::Io { source } => {
                write!(f, "I/O error while supervising startosinstall: {source}")
            }
            StartOsInstallError::Failed { return_code } => {
                write!(f, "startosinstall failed with return code {return_code}")
            }
            StartOsInstallError::TimedOut { secs, return_code } => {
                write!(
                    f,
                    "startosinstall timed out after {secs} seconds without output (return code {return_code})"
                )
            }
            StartOsInstallError::HandlerInstalled => {
                write!(f, "a startosinstall handshake handler is already installed")
            }
            StartOsInstallError::Locked { path, source } => {
                write!(
                    f,
                    "another install run holds the lock {}: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for StartOsInstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartOsInstallError::Spawn { source, .. } => Some(source),
            StartOsInstallError::Io { source } => Some(source),
            StartOsInstallError::Locked { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StartOsInstallError {
    fn from(e: std::io::Error) -> Self {
        StartOsInstallError::Io { source: e }
    }
}
