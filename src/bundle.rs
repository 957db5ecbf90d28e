/// Locating the installer application on a mounted volume and reading its
/// OS version.
use crate::config::VolumeConfig;
use crate::error::StartOsInstallError;
use crate::volume::VolumeLifecycle;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The resolved installer application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerBundle {
    pub application_path: PathBuf,
    pub installer_executable_path: PathBuf,
    /// Empty when the bundle metadata could not be read.
    pub os_version: String,
}

#[derive(Deserialize)]
struct InstallInfo {
    #[serde(rename = "System Image Info")]
    system_image_info: SystemImageInfo,
}

#[derive(Deserialize)]
struct SystemImageInfo {
    version: String,
}

/// Read the OS version advertised by the installer application.
///
/// Missing file, malformed plist, missing key and wrong value type all
/// collapse into an empty string.
pub fn read_os_version(application_path: &Path, metadata_relative_path: &Path) -> String {
    let path = application_path.join(metadata_relative_path);
    match plist::from_file::<_, InstallInfo>(&path) {
        Ok(info) => info.system_image_info.version,
        Err(e) => {
            tracing::debug!(
                error = %e,
                path = %path.display(),
                "installer version unavailable"
            );
            String::new()
        }
    }
}

/// Find the first top-level entry of `mountpoint` containing the installer executable.
pub fn find_installer(mountpoint: &Path, installer_relative_path: &Path) -> Option<(PathBuf, PathBuf)> {
    let entries = match std::fs::read_dir(mountpoint) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                error = %e,
                mountpoint = %mountpoint.display(),
                "failed to list mounted volume"
            );
            return None;
        }
    };

    let mut items: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    items.sort();

    items.into_iter().find_map(|item| {
        let installer = item.join(installer_relative_path);
        installer.exists().then_some((item, installer))
    })
}

/// Mount the volume and resolve the installer bundle on it.
///
/// If the volume mounts but holds no installer, it is unmounted again
/// before the error is returned.
pub fn resolve_bundle(
    lifecycle: &mut VolumeLifecycle<'_>,
    config: &VolumeConfig,
) -> Result<InstallerBundle, StartOsInstallError> {
    let mountpoint = lifecycle.mount()?;

    let Some((application_path, installer_executable_path)) =
        find_installer(&mountpoint, &config.installer_relative_path)
    else {
        lifecycle.release();
        return Err(StartOsInstallError::BundleNotFound {
            path: lifecycle.volume().path.clone(),
        });
    };

    let os_version = read_os_version(&application_path, &config.metadata_relative_path);
    tracing::info!(
        application = %application_path.display(),
        installer = %installer_executable_path.display(),
        os_version = %os_version,
        "resolved installer bundle"
    );

    Ok(InstallerBundle {
        application_path,
        installer_executable_path,
        os_version,
    })
}
