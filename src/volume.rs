/// Disk image mounting and the mounted-volume lifecycle.
///
/// The volume is released on exactly one path: when the install fails. On
/// success the machine is about to reboot and the mount is left alone.
use crate::error::StartOsInstallError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

const DISK_IMAGE_EXTS: &[&str] = &["dmg", "iso", "sparseimage", "sparsebundle"];

/// `hdiutil attach` prints one tab-separated row per attached device; rows
/// that mounted a filesystem carry the mountpoint in the third column.
static ATTACH_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/[^\t]*\t[^\t]*\t\s*(/.*?)\s*$").unwrap());

/// True if `path` carries a disk image extension we know how to mount.
pub fn has_valid_disk_image_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            DISK_IMAGE_EXTS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Extract mountpoints from `hdiutil attach` output, in the order listed.
pub fn parse_attach_output(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| ATTACH_ROW.captures(line))
        .map(|caps| PathBuf::from(&caps[1]))
        .collect()
}

/// Mount service for disk images.
pub trait VolumeMounter: Send + Sync {
    /// Attach `image` and return every mountpoint it produced (possibly none).
    fn mount(&self, image: &Path) -> Result<Vec<PathBuf>, StartOsInstallError>;

    /// Detach a previously returned mountpoint.
    fn unmount(&self, mountpoint: &Path) -> Result<(), StartOsInstallError>;
}

/// Mounts images with `hdiutil`.
pub struct HdiutilMounter {
    hdiutil: PathBuf,
}

impl HdiutilMounter {
    pub fn new(hdiutil: impl Into<PathBuf>) -> Self {
        Self {
            hdiutil: hdiutil.into(),
        }
    }

    fn detach(&self, mountpoint: &Path, force: bool) -> std::io::Result<std::process::Output> {
        let mut cmd = Command::new(&self.hdiutil);
        cmd.arg("detach").arg(mountpoint);
        if force {
            cmd.arg("-force");
        }
        cmd.output()
    }
}

impl VolumeMounter for HdiutilMounter {
    fn mount(&self, image: &Path) -> Result<Vec<PathBuf>, StartOsInstallError> {
        tracing::info!(image = %image.display(), "mounting disk image");
        let output = Command::new(&self.hdiutil)
            .arg("attach")
            .arg(image)
            .args(["-mountRandom", "/tmp", "-nobrowse", "-noverify", "-noautoopen"])
            .output()
            .map_err(|e| StartOsInstallError::Mount {
                path: image.to_path_buf(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(StartOsInstallError::Mount {
                path: image.to_path_buf(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mountpoints = parse_attach_output(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(?mountpoints, "disk image attached");
        Ok(mountpoints)
    }

    fn unmount(&self, mountpoint: &Path) -> Result<(), StartOsInstallError> {
        tracing::info!(mountpoint = %mountpoint.display(), "unmounting disk image");
        let output = self.detach(mountpoint, false)?;
        if output.status.success() {
            return Ok(());
        }

        tracing::warn!(
            mountpoint = %mountpoint.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "detach failed, retrying with -force"
        );
        let output = self.detach(mountpoint, true)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StartOsInstallError::Mount {
                path: mountpoint.to_path_buf(),
                detail: format!(
                    "detach failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

/// The disk image being supervised.
#[derive(Debug, Clone)]
pub struct Volume {
    pub path: PathBuf,
    /// Set if and only if the mount succeeded and has not been released.
    pub mountpoint: Option<PathBuf>,
    pub valid: bool,
}

/// Owns the mounted volume for one supervision run.
pub struct VolumeLifecycle<'m> {
    volume: Volume,
    mounter: &'m dyn VolumeMounter,
}

impl<'m> VolumeLifecycle<'m> {
    pub fn new(path: impl Into<PathBuf>, mounter: &'m dyn VolumeMounter) -> Self {
        let path = path.into();
        let valid = has_valid_disk_image_ext(&path);
        Self {
            volume: Volume {
                path,
                mountpoint: None,
                valid,
            },
            mounter,
        }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Validate and mount the image, returning the first mountpoint.
    pub fn mount(&mut self) -> Result<PathBuf, StartOsInstallError> {
        if !self.volume.valid {
            return Err(StartOsInstallError::InvalidVolume {
                path: self.volume.path.clone(),
            });
        }

        let mountpoints = self.mounter.mount(&self.volume.path)?;
        let Some(first) = mountpoints.into_iter().next() else {
            return Err(StartOsInstallError::NoMountpoints {
                path: self.volume.path.clone(),
            });
        };

        self.volume.mountpoint = Some(first.clone());
        Ok(first)
    }

    /// Unmount the volume if it is still mounted. Later calls are no-ops.
    pub fn release(&mut self) {
        let Some(mountpoint) = self.volume.mountpoint.take() else {
            return;
        };
        if let Err(e) = self.mounter.unmount(&mountpoint) {
            tracing::warn!(error = %e, "failed to unmount installer volume");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Mounter double that hands out a fixed mountpoint and records unmounts.
    pub struct RecordingMounter {
        mountpoints: Vec<PathBuf>,
        pub unmounted: Mutex<Vec<PathBuf>>,
    }

    impl RecordingMounter {
        pub fn new(mountpoints: Vec<PathBuf>) -> Self {
            Self {
                mountpoints,
                unmounted: Mutex::new(Vec::new()),
            }
        }

        pub fn unmount_count(&self) -> usize {
            self.unmounted.lock().unwrap().len()
        }
    }

    impl VolumeMounter for RecordingMounter {
        fn mount(&self, _image: &Path) -> Result<Vec<PathBuf>, StartOsInstallError> {
            Ok(self.mountpoints.clone())
        }

        fn unmount(&self, mountpoint: &Path) -> Result<(), StartOsInstallError> {
            self.unmounted
                .lock()
                .unwrap()
                .push(mountpoint.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingMounter;
    use super::*;

    #[test]
    fn test_disk_image_extensions() {
        assert!(has_valid_disk_image_ext(Path::new("/tmp/Install macOS.dmg")));
        assert!(has_valid_disk_image_ext(Path::new("/tmp/installer.ISO")));
        assert!(has_valid_disk_image_ext(Path::new("a.sparsebundle")));
        assert!(has_valid_disk_image_ext(Path::new("a.sparseimage")));
        assert!(!has_valid_disk_image_ext(Path::new("/tmp/Install macOS.app")));
        assert!(!has_valid_disk_image_ext(Path::new("/tmp/dmg")));
    }

    #[test]
    fn test_parse_attach_output_picks_mounted_rows() {
        let output = "/dev/disk4          \tGUID_partition_scheme          \t\n\
                      /dev/disk4s1        \tEFI                            \t\n\
                      /dev/disk4s2        \tApple_HFS                      \t/private/tmp/dmg.Xy12Ab\n";
        assert_eq!(
            parse_attach_output(output),
            vec![PathBuf::from("/private/tmp/dmg.Xy12Ab")]
        );
    }

    #[test]
    fn test_parse_attach_output_keeps_spaces_in_mountpoint() {
        let output = "/dev/disk5s1\tApple_HFS\t/Volumes/Install macOS Sierra\n";
        assert_eq!(
            parse_attach_output(output),
            vec![PathBuf::from("/Volumes/Install macOS Sierra")]
        );
    }

    #[test]
    fn test_parse_attach_output_empty() {
        assert!(parse_attach_output("").is_empty());
        assert!(parse_attach_output("hdiutil: attach failed\n").is_empty());
    }

    #[test]
    fn test_mount_rejects_non_image() {
        let mounter = RecordingMounter::new(vec![PathBuf::from("/tmp/mnt")]);
        let mut lifecycle = VolumeLifecycle::new("/tmp/readme.txt", &mounter);
        assert!(!lifecycle.volume().valid);
        let err = lifecycle.mount().unwrap_err();
        assert!(matches!(err, StartOsInstallError::InvalidVolume { .. }));
        assert!(lifecycle.volume().mountpoint.is_none());
    }

    #[test]
    fn test_mount_without_mountpoints_errors() {
        let mounter = RecordingMounter::new(vec![]);
        let mut lifecycle = VolumeLifecycle::new("/tmp/Install.dmg", &mounter);
        let err = lifecycle.mount().unwrap_err();
        assert!(matches!(err, StartOsInstallError::NoMountpoints { .. }));
        assert!(lifecycle.volume().mountpoint.is_none());
    }

    #[test]
    fn test_mount_uses_first_mountpoint() {
        let mounter = RecordingMounter::new(vec![
            PathBuf::from("/tmp/first"),
            PathBuf::from("/tmp/second"),
        ]);
        let mut lifecycle = VolumeLifecycle::new("/tmp/Install.dmg", &mounter);
        assert_eq!(lifecycle.mount().unwrap(), PathBuf::from("/tmp/first"));
        assert_eq!(
            lifecycle.volume().mountpoint,
            Some(PathBuf::from("/tmp/first"))
        );
    }

    #[test]
    fn test_release_unmounts_exactly_once() {
        let mounter = RecordingMounter::new(vec![PathBuf::from("/tmp/first")]);
        let mut lifecycle = VolumeLifecycle::new("/tmp/Install.dmg", &mounter);
        lifecycle.mount().unwrap();

        lifecycle.release();
        lifecycle.release();

        assert_eq!(mounter.unmount_count(), 1);
        assert!(lifecycle.volume().mountpoint.is_none());
    }

    #[test]
    fn test_release_before_mount_is_noop() {
        let mounter = RecordingMounter::new(vec![PathBuf::from("/tmp/first")]);
        let mut lifecycle = VolumeLifecycle::new("/tmp/Install.dmg", &mounter);
        lifecycle.release();
        assert_eq!(mounter.unmount_count(), 0);
    }

    #[test]
    fn test_hdiutil_mount_spawn_failure_is_mount_error() {
        let mounter = HdiutilMounter::new("/nonexistent/hdiutil");
        let err = mounter.mount(Path::new("/tmp/Install.dmg")).unwrap_err();
        assert!(matches!(err, StartOsInstallError::Mount { .. }));
    }
}
