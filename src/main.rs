mod bundle;
mod config;
mod error;
mod launch;
mod lock;
mod progress;
mod runner;
mod session;
mod signals;
mod status;
mod version;
mod volume;

use clap::Parser;
use config::RunnerConfig;
use signals::KillallSignaller;
use status::StatusReporter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use volume::HdiutilMounter;

/// Run startosinstall from an Install macOS disk image: stream its progress,
/// kill it if it stalls, and release it to reboot once it is ready.
#[derive(Parser, Debug)]
#[command(name = "osinstall-runner", version, about)]
pub struct Cli {
    /// Disk image holding the Install macOS application
    #[arg(value_name = "DISK_IMAGE")]
    image: PathBuf,

    /// Config file path (default: built-in settings)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds without installer output before it is killed (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// JSON status file to keep updated (overrides config)
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Durable log file (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print resolved settings and exit without mounting anything
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (wrapper choice, state transitions, handshake)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RunnerConfig) {
        if let Some(timeout) = self.timeout {
            config.watchdog.stale_timeout_secs = timeout;
        }
        if let Some(path) = &self.status_file {
            config.status.status_file = Some(path.clone());
        }
        if let Some(path) = &self.log_file {
            config.status.log_file = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "osinstall_runner=debug"
    } else {
        "osinstall_runner=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match RunnerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    if cli.dry_run {
        println!("osinstall-runner v{}", env!("CARGO_PKG_VERSION"));
        println!("Disk image: {}", cli.image.display());
        println!("{config:#?}");
        println!("Dry run mode: config resolved, not running.");
        return ExitCode::SUCCESS;
    }

    let mounter = HdiutilMounter::new(&config.volume.hdiutil);
    let sink = StatusReporter::new(
        config.status.status_file.clone(),
        config.status.log_file.clone(),
    );
    let deps = runner::Collaborators {
        mounter: &mounter,
        signaller: Arc::new(KillallSignaller::new(&config.handshake.killall)),
        sink: &sink,
    };

    if runner::startosinstall(&cli.image, &config, &deps).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
