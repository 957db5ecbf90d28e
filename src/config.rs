use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from an optional TOML file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    pub volume: VolumeConfig,
    pub launch: LaunchConfig,
    pub watchdog: WatchdogConfig,
    pub handshake: HandshakeConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub hdiutil: PathBuf,
    pub installer_relative_path: PathBuf,
    pub metadata_relative_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub helper_name: String,
    pub helper_fallback: PathBuf,
    pub script_command: Vec<String>,
    pub reboot_delay_secs: u64,
    pub volume_flag_before: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_ms: u64,
    pub stale_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub signal: String,
    pub grace_secs: u64,
    pub killall: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StatusConfig {
    pub status_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Number of consecutive empty polls after which the installer counts as stalled.
    pub fn stale_ticks(&self) -> u64 {
        (self.stale_timeout_secs.saturating_mul(1000) / self.poll_interval_ms.max(1)).max(1)
    }
}

impl HandshakeConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

// --- Default implementations ---

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            hdiutil: PathBuf::from("/usr/bin/hdiutil"),
            installer_relative_path: PathBuf::from("Contents/Resources/startosinstall"),
            metadata_relative_path: PathBuf::from("Contents/SharedSupport/InstallInfo.plist"),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            helper_name: "ptyexec".to_string(),
            helper_fallback: PathBuf::from("/usr/local/munki/ptyexec"),
            script_command: vec![
                "/usr/bin/script".to_string(),
                "-q".to_string(),
                "-t".to_string(),
                "1".to_string(),
                "/dev/null".to_string(),
            ],
            reboot_delay_secs: 300,
            volume_flag_before: "10.12.4".to_string(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stale_timeout_secs: 2 * 60 * 60,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            signal: "SIGUSR1".to_string(),
            grace_secs: 1,
            killall: PathBuf::from("/usr/bin/killall"),
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl RunnerConfig {
    /// Load from `path`, or return the built-in defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
