/// Status reporting for a supervision run.
///
/// `StatusSink` is where classified installer events go. `StatusReporter`
/// logs them and, when configured, keeps a JSON status file current and
/// appends durable log lines.
use crate::progress::ProgressEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// Receiver of everything the supervisor has to say.
pub trait StatusSink: Send + Sync {
    /// Major status line, e.g. "Starting macOS 10.12.4 install...".
    fn headline(&self, message: &str);
    fn event(&self, event: &ProgressEvent);
    fn error(&self, message: &str);
    /// Line that must survive in the durable log.
    fn record(&self, message: &str);
    fn state(&self, _state: SupervisorState) {}
}

/// Latest view of the run, and the JSON body of the status file.
#[derive(Debug, Clone, Serialize)]
struct RunSnapshot {
    pid: u32,
    state: SupervisorState,
    /// Last reported percentage; -1 when the installer's line was unreadable.
    percent: Option<i32>,
    message: String,
    started: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl RunSnapshot {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            state: SupervisorState::Starting,
            percent: None,
            message: String::new(),
            started: now,
            last_update: now,
        }
    }

    /// Replace `path` with this snapshot. The temp file lives next to the
    /// target so the final rename never crosses filesystems.
    fn persist(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Default sink: tracing output plus optional status and log files.
pub struct StatusReporter {
    status_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    snapshot: Mutex<RunSnapshot>,
}

impl StatusReporter {
    pub fn new(status_file: Option<PathBuf>, log_file: Option<PathBuf>) -> Self {
        Self {
            status_file,
            log_file,
            snapshot: Mutex::new(RunSnapshot::new()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RunSnapshot)) {
        let Ok(mut snapshot) = self.snapshot.lock() else {
            return;
        };
        apply(&mut snapshot);
        snapshot.last_update = Utc::now();

        if let Some(path) = &self.status_file {
            if let Err(e) = snapshot.persist(path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to write status file");
            }
        }
    }

    fn append_log(&self, message: &str) {
        let Some(path) = &self.log_file else {
            return;
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                writeln!(
                    file,
                    "{} {message}",
                    Utc::now().format("%b %d %Y %H:%M:%S %z")
                )
            });
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %path.display(), "failed to append to log file");
        }
    }
}

impl StatusSink for StatusReporter {
    fn headline(&self, message: &str) {
        tracing::info!("{message}");
        self.update(|s| s.message = message.to_string());
    }

    fn event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Status(message) => {
                tracing::info!("    {message}");
                self.update(|s| s.message = message.clone());
            }
            ProgressEvent::Progress(percent) => {
                tracing::info!(percent, "percent done");
                self.update(|s| s.percent = Some(*percent));
            }
            ProgressEvent::Ignored => {}
        }
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }

    fn record(&self, message: &str) {
        tracing::info!("{message}");
        self.append_log(message);
    }

    fn state(&self, state: SupervisorState) {
        tracing::debug!(?state, "supervisor state changed");
        self.update(|s| s.state = state);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Everything a `RecordingSink` saw, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SinkEntry {
        Headline(String),
        Event(ProgressEvent),
        Error(String),
        Record(String),
        State(SupervisorState),
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub entries: Mutex<Vec<SinkEntry>>,
    }

    impl RecordingSink {
        pub fn entries(&self) -> Vec<SinkEntry> {
            self.entries.lock().unwrap().clone()
        }

        pub fn events(&self) -> Vec<ProgressEvent> {
            self.entries()
                .into_iter()
                .filter_map(|entry| match entry {
                    SinkEntry::Event(event) => Some(event),
                    _ => None,
                })
                .collect()
        }

        pub fn errors(&self) -> Vec<String> {
            self.entries()
                .into_iter()
                .filter_map(|entry| match entry {
                    SinkEntry::Error(message) => Some(message),
                    _ => None,
                })
                .collect()
        }

        pub fn states(&self) -> Vec<SupervisorState> {
            self.entries()
                .into_iter()
                .filter_map(|entry| match entry {
                    SinkEntry::State(state) => Some(state),
                    _ => None,
                })
                .collect()
        }

        fn push(&self, entry: SinkEntry) {
            self.entries.lock().unwrap().push(entry);
        }
    }

    impl StatusSink for RecordingSink {
        fn headline(&self, message: &str) {
            self.push(SinkEntry::Headline(message.to_string()));
        }

        fn event(&self, event: &ProgressEvent) {
            self.push(SinkEntry::Event(event.clone()));
        }

        fn error(&self, message: &str) {
            self.push(SinkEntry::Error(message.to_string()));
        }

        fn record(&self, message: &str) {
            self.push(SinkEntry::Record(message.to_string()));
        }

        fn state(&self, state: SupervisorState) {
            self.push(SinkEntry::State(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_replaces_file_without_leftovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osinstall.status");
        std::fs::write(&path, "stale").unwrap();

        let mut snapshot = RunSnapshot::new();
        snapshot.state = SupervisorState::Running;
        snapshot.percent = Some(42);
        snapshot.persist(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["pid"], std::process::id());
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["percent"], 42);

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1, "temp file should be renamed away");
    }

    #[test]
    fn test_snapshot_to_missing_dir_fails() {
        let err = RunSnapshot::new()
            .persist(Path::new("/nonexistent-dir/osinstall.status"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_reporter_survives_unwritable_status_file() {
        let reporter =
            StatusReporter::new(Some(PathBuf::from("/nonexistent-dir/osinstall.status")), None);
        reporter.state(SupervisorState::Running);
        reporter.event(&ProgressEvent::Progress(10));
    }

    #[test]
    fn test_reporter_tracks_state_and_progress() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osinstall.status");
        let reporter = StatusReporter::new(Some(path.clone()), None);

        reporter.state(SupervisorState::Running);
        reporter.event(&ProgressEvent::Progress(-1));
        reporter.event(&ProgressEvent::Status("Waiting to reboot".to_string()));
        reporter.event(&ProgressEvent::Ignored);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["percent"], -1);
        assert_eq!(parsed["message"], "Waiting to reboot");

        reporter.state(SupervisorState::TimedOut);
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "timed_out");
    }

    #[test]
    fn test_reporter_appends_durable_records() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("install.log");
        let reporter = StatusReporter::new(None, Some(log.clone()));

        reporter.record("first");
        reporter.record("macOS install successfully set up.");

        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" macOS install successfully set up."));
    }

    #[test]
    fn test_reporter_without_files_is_quiet() {
        let reporter = StatusReporter::new(None, None);
        reporter.headline("Starting macOS  install...");
        reporter.record("nothing to append to");
        reporter.error("still fine");
    }
}
