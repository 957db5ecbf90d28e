/// Building the startosinstall command line.
///
/// startosinstall only writes progress unbuffered when it believes a
/// terminal is attached, so it is launched under a pty wrapper: the bundled
/// `ptyexec` helper next to our own executable, then the helper at its
/// usual install path, then `script(1)` as a last resort (it polls stdin
/// and burns CPU, so it is never preferred).
use crate::bundle::InstallerBundle;
use crate::config::LaunchConfig;
use crate::version::is_older_than;
use std::path::{Path, PathBuf};

/// Environment override that asks Foundation tools not to buffer stdout.
pub const UNBUFFERED_ENV: (&str, &str) = ("NSUnbufferedIO", "YES");

/// Fully resolved command to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Whole argument vector, program first.
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Pick the first existing helper, else fall back to the script command.
pub fn select_wrapper(helpers: &[PathBuf], script_command: &[String]) -> Vec<String> {
    match helpers.iter().find(|path| path.exists()) {
        Some(helper) => vec![helper.to_string_lossy().into_owned()],
        None => script_command.to_vec(),
    }
}

pub struct LaunchStrategy<'a> {
    config: &'a LaunchConfig,
    program_dir: Option<PathBuf>,
}

impl<'a> LaunchStrategy<'a> {
    /// Strategy that looks for the bundled helper beside the running executable.
    pub fn new(config: &'a LaunchConfig) -> Self {
        let program_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            config,
            program_dir,
        }
    }

    /// Strategy with an explicit install location for the bundled helper.
    pub fn with_program_dir(config: &'a LaunchConfig, program_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            program_dir: Some(program_dir.into()),
        }
    }

    fn helper_candidates(&self) -> Vec<PathBuf> {
        self.program_dir
            .iter()
            .map(|dir| dir.join(&self.config.helper_name))
            .chain(std::iter::once(self.config.helper_fallback.clone()))
            .collect()
    }

    /// Build the plan for `bundle`, advertising `signal_pid` as the process
    /// startosinstall should signal when it is ready to reboot.
    pub fn plan(&self, bundle: &InstallerBundle, signal_pid: u32) -> LaunchPlan {
        let mut cmd = select_wrapper(&self.helper_candidates(), &self.config.script_command);

        cmd.extend([
            bundle.installer_executable_path.to_string_lossy().into_owned(),
            "--agreetolicense".to_string(),
            "--applicationpath".to_string(),
            bundle.application_path.to_string_lossy().into_owned(),
            "--rebootdelay".to_string(),
            self.config.reboot_delay_secs.to_string(),
            "--pidtosignal".to_string(),
            signal_pid.to_string(),
            "--nointeraction".to_string(),
        ]);

        // Required before 10.12.4 and rejected from 10.12.4 on.
        if is_older_than(&bundle.os_version, &self.config.volume_flag_before) {
            cmd.extend(["--volume".to_string(), "/".to_string()]);
        }

        let mut cmd = cmd.into_iter();
        let program = cmd.next().unwrap_or_default();
        LaunchPlan {
            program,
            args: cmd.collect(),
            env: vec![(UNBUFFERED_ENV.0.to_string(), UNBUFFERED_ENV.1.to_string())],
        }
    }
}
