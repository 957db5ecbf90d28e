/// Top-level operation: install macOS from an Install macOS.app stored at the
/// root of a disk image.
///
/// A successful run always ends in a reboot driven by startosinstall, so this
/// must be the last thing a managed-software run does.
use crate::bundle::resolve_bundle;
use crate::config::RunnerConfig;
use crate::error::StartOsInstallError;
use crate::launch::LaunchStrategy;
use crate::lock::RunLock;
use crate::session::ProcessSupervisor;
use crate::signals::{InstallerSignaller, SignalCoordinator};
use crate::status::StatusSink;
use crate::volume::{VolumeLifecycle, VolumeMounter};
use std::path::Path;
use std::sync::Arc;

/// External services a run depends on.
pub struct Collaborators<'a> {
    pub mounter: &'a dyn VolumeMounter,
    pub signaller: Arc<dyn InstallerSignaller>,
    pub sink: &'a dyn StatusSink,
}

/// Run one supervised install from `image`.
pub async fn start(
    image: &Path,
    config: &RunnerConfig,
    deps: &Collaborators<'_>,
) -> Result<(), StartOsInstallError> {
    let _lock = config
        .status
        .lock_file
        .as_deref()
        .map(RunLock::acquire)
        .transpose()?;

    let installer_name = config
        .volume
        .installer_relative_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Installed before launch so the installer can never signal an unprepared process.
    let coordinator =
        SignalCoordinator::install(&config.handshake, installer_name, Arc::clone(&deps.signaller))?;

    let mut lifecycle = VolumeLifecycle::new(image, deps.mounter);
    let bundle = resolve_bundle(&mut lifecycle, &config.volume)?;

    deps.sink
        .headline(&format!("Starting macOS {} install...", bundle.os_version));

    let plan = LaunchStrategy::new(&config.launch).plan(&bundle, std::process::id());
    let result = ProcessSupervisor::new(&config.watchdog, deps.sink)
        .run(&plan, &mut lifecycle)
        .await;

    tracing::info!(
        handshake = coordinator.handshake_received(),
        ok = result.is_ok(),
        "startosinstall supervision finished"
    );
    result
}

/// Like [`start`], but reports errors and returns whether the install was set up.
pub async fn startosinstall(image: &Path, config: &RunnerConfig, deps: &Collaborators<'_>) -> bool {
    match start(image, config, deps).await {
        Ok(()) => true,
        Err(e) => {
            deps.sink
                .error(&format!("Error starting macOS install: {e}"));
            false
        }
    }
}
