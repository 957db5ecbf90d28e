/// Reboot hand-off with startosinstall.
///
/// startosinstall signals the pid passed as `--pidtosignal` once it has
/// staged the install and is waiting to reboot. We answer with the same
/// signal after a short grace period, which releases it to restart.
///
/// The answer is delivered by process name, not to the pid we spawned:
/// the child we own is the pty wrapper, and startosinstall runs beneath it.
///
/// The OS-level handler only feeds a channel (tokio's signal driver); the
/// listener task consumes it and never touches the supervisor's session
/// state.
use crate::config::HandshakeConfig;
use crate::error::StartOsInstallError;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Set while a coordinator is installed; at most one per process.
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Delivers a signal to the logical installer process.
pub trait InstallerSignaller: Send + Sync {
    fn signal_by_name(&self, name: &str, signal: Signal) -> std::io::Result<()>;
}

/// Signals every process with a matching name via `killall`.
pub struct KillallSignaller {
    killall: PathBuf,
}

impl KillallSignaller {
    pub fn new(killall: impl Into<PathBuf>) -> Self {
        Self {
            killall: killall.into(),
        }
    }
}

impl InstallerSignaller for KillallSignaller {
    fn signal_by_name(&self, name: &str, signal: Signal) -> std::io::Result<()> {
        let status = std::process::Command::new(&self.killall)
            .arg(format!("-{}", signal.as_str()))
            .arg(name)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "{} exited with {status}",
                self.killall.display()
            )))
        }
    }
}

/// Parse a signal name such as "SIGUSR1" (the "SIG" prefix is optional).
pub fn parse_signal(name: &str) -> Option<Signal> {
    let name = name.trim().to_ascii_uppercase();
    if name.starts_with("SIG") {
        Signal::from_str(&name).ok()
    } else {
        Signal::from_str(&format!("SIG{name}")).ok()
    }
}

/// Owns the installed handshake handler for one supervision run.
///
/// Dropping it stops listening and frees the slot for a later run.
pub struct SignalCoordinator {
    task: JoinHandle<()>,
    handshake: watch::Receiver<bool>,
}

impl SignalCoordinator {
    /// Start listening for the installer's ready-to-reboot signal.
    ///
    /// Must be called from within a tokio runtime and before the installer
    /// is launched.
    pub fn install(
        config: &HandshakeConfig,
        installer_name: impl Into<String>,
        signaller: Arc<dyn InstallerSignaller>,
    ) -> Result<Self, StartOsInstallError> {
        let sig = parse_signal(&config.signal).ok_or_else(|| StartOsInstallError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown handshake signal {:?}", config.signal),
            ),
        })?;

        if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(StartOsInstallError::HandlerInstalled);
        }

        let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
            Ok(stream) => stream,
            Err(e) => {
                HANDLER_INSTALLED.store(false, Ordering::SeqCst);
                return Err(StartOsInstallError::Io { source: e });
            }
        };

        let (tx, rx) = watch::channel(false);
        let installer_name = installer_name.into();
        let grace = config.grace();
        tracing::debug!(signal = sig.as_str(), installer = %installer_name, "handshake handler installed");

        let task = tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!(signal = sig.as_str(), "got ready-to-reboot signal from startosinstall");
                tx.send_replace(true);
                acknowledge(&installer_name, sig, grace, Arc::clone(&signaller)).await;
            }
        });

        Ok(Self { task, handshake: rx })
    }

    /// Whether the installer has signalled that it is ready to reboot.
    pub fn handshake_received(&self) -> bool {
        *self.handshake.borrow()
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        self.task.abort();
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
    }
}

async fn acknowledge(
    installer_name: &str,
    sig: Signal,
    grace: Duration,
    signaller: Arc<dyn InstallerSignaller>,
) {
    // Room for cleanup and notifications before the machine goes down.
    tokio::time::sleep(grace).await;

    let name = installer_name.to_string();
    let result = tokio::task::spawn_blocking(move || signaller.signal_by_name(&name, sig)).await;
    match result {
        Ok(Ok(())) => {
            tracing::info!(installer = %installer_name, signal = sig.as_str(), "released startosinstall to reboot")
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, installer = %installer_name, "failed to signal startosinstall")
        }
        Err(e) => tracing::warn!(error = %e, "signal delivery task failed"),
    }
}
