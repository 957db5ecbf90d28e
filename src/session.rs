/// Supervision of a single startosinstall run: spawn it, stream and classify
/// its output, kill it if it goes quiet for too long, and turn its exit
/// into exactly one outcome.
///
/// States: starting -> running -> succeeded | failed | timed_out.
use crate::config::WatchdogConfig;
use crate::error::StartOsInstallError;
use crate::launch::LaunchPlan;
use crate::progress::{classify_line, ProgressEvent};
use crate::status::{StatusSink, SupervisorState};
use crate::volume::VolumeLifecycle;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Brackets the transcript dump on failure.
const SEPARATOR_WIDTH: usize = 78;

/// How long to wait for the stderr reader once the installer is gone.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Live state of the spawned installer. Owned by the supervisor loop alone.
#[derive(Debug)]
pub struct ProcessSession {
    pub pid: u32,
    pub command_line: Vec<String>,
    pub env: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
    /// Consecutive polls without a line of output.
    pub inactive_ticks: u64,
    /// Every stdout line (and, on failure, stderr), in arrival order.
    pub output: Vec<String>,
}

impl ProcessSession {
    fn new(pid: u32, plan: &LaunchPlan) -> Self {
        Self {
            pid,
            command_line: plan.command_line(),
            env: plan.env.clone(),
            started_at: Utc::now(),
            inactive_ticks: 0,
            output: Vec::new(),
        }
    }

    fn record_line(&mut self, line: String) {
        self.inactive_ticks = 0;
        self.output.push(line);
    }
}

enum ReadResult {
    Line(String),
    Idle,
    Eof,
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    buf.clear();
    line
}

/// Wait up to `wait` for one line. `buf` keeps partial input across calls,
/// so a timed-out read loses nothing.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    wait: Duration,
) -> ReadResult {
    match tokio::time::timeout(wait, reader.read_until(b'\n', buf)).await {
        Err(_) => ReadResult::Idle,
        Ok(Ok(0)) if buf.is_empty() => ReadResult::Eof,
        Ok(Ok(_)) => ReadResult::Line(take_line(buf)),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read startosinstall output");
            ReadResult::Eof
        }
    }
}

/// stderr lines collected so far. Shared with the reader task so a reader
/// that never sees EOF still leaves its lines behind.
type StderrLines = Arc<Mutex<Vec<String>>>;

async fn drain_lines<R: AsyncRead + Unpin>(stream: Option<R>, lines: StderrLines) {
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = take_line(&mut buf);
                if let Ok(mut lines) = lines.lock() {
                    lines.push(line);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "stderr read ended early");
                break;
            }
        }
    }
}

/// Exit code, or `-signal` for a process killed by a signal.
pub fn return_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

/// Kill the installer's whole process group: the wrapper we spawned and
/// startosinstall beneath it.
async fn kill_session(child: &mut Child, pid: u32) -> std::io::Result<ExitStatus> {
    if pid > 0 {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::warn!(pid, error = %e, "failed to kill startosinstall process group");
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid, error = %e, "child already gone");
    }
    child.wait().await
}

pub struct ProcessSupervisor<'a> {
    watchdog: &'a WatchdogConfig,
    sink: &'a dyn StatusSink,
    stderr_grace: Duration,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(watchdog: &'a WatchdogConfig, sink: &'a dyn StatusSink) -> Self {
        Self {
            watchdog,
            sink,
            stderr_grace: STDERR_DRAIN_GRACE,
        }
    }

    fn handle_line(&self, session: &mut ProcessSession, line: String) {
        let event = classify_line(&line);
        session.record_line(line);
        self.sink.event(&event);
    }

    /// Launch `plan` and supervise it until it exits or stalls.
    ///
    /// On any failure the volume is released before returning; on success
    /// it is left mounted for the reboot.
    pub async fn run(
        &self,
        plan: &LaunchPlan,
        lifecycle: &mut VolumeLifecycle<'_>,
    ) -> Result<(), StartOsInstallError> {
        self.sink.state(SupervisorState::Starting);

        let spawned = Command::new(&plan.program)
            .args(&plan.args)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group so a stall kill takes the installer too
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.sink.state(SupervisorState::Failed);
                lifecycle.release();
                return Err(StartOsInstallError::Spawn {
                    program: plan.program.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let mut session = ProcessSession::new(pid, plan);
        tracing::info!(
            pid,
            command = ?session.command_line,
            env = ?session.env,
            "startosinstall started"
        );
        self.sink.state(SupervisorState::Running);

        let stderr_lines = StderrLines::default();
        let mut stderr_task =
            tokio::spawn(drain_lines(child.stderr.take(), stderr_lines.clone()));
        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut buf = Vec::new();

        let poll = self.watchdog.poll_interval();
        let ceiling = self.watchdog.stale_ticks();

        let (status, timed_out) = loop {
            if let Some(reader) = stdout.as_mut() {
                match read_line(reader, &mut buf, poll).await {
                    ReadResult::Line(line) => {
                        self.handle_line(&mut session, line);
                        continue;
                    }
                    ReadResult::Eof => stdout = None,
                    ReadResult::Idle => {}
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => break (status, false),
                Ok(None) => {}
                Err(e) => {
                    self.sink.state(SupervisorState::Failed);
                    lifecycle.release();
                    return Err(e.into());
                }
            }

            session.inactive_ticks += 1;
            if session.inactive_ticks >= ceiling {
                tracing::warn!(
                    pid,
                    ticks = session.inactive_ticks,
                    "no output from startosinstall, killing it"
                );
                match kill_session(&mut child, pid).await {
                    Ok(status) => break (status, true),
                    Err(e) => {
                        self.sink.state(SupervisorState::TimedOut);
                        lifecycle.release();
                        return Err(e.into());
                    }
                }
            }

            if stdout.is_none() {
                tokio::time::sleep(poll).await;
            }
        };

        // Anything written just before exit is still in the pipe.
        if !timed_out {
            if let Some(reader) = stdout.as_mut() {
                while let ReadResult::Line(line) = read_line(reader, &mut buf, poll).await {
                    self.handle_line(&mut session, line);
                }
            }
        }

        let code = return_code(status);
        tracing::info!(
            pid = session.pid,
            return_code = code,
            duration_secs = (Utc::now() - session.started_at).num_seconds(),
            lines = session.output.len(),
            "startosinstall exited"
        );

        if status.success() && !timed_out {
            stderr_task.abort();
            self.sink.state(SupervisorState::Succeeded);
            self.sink.record("macOS install successfully set up.");
            self.sink.event(&ProgressEvent::Progress(100));
            return Ok(());
        }

        let secs = self.watchdog.stale_timeout_secs;
        if timed_out {
            self.sink.state(SupervisorState::TimedOut);
            self.sink
                .error(&format!("startosinstall timeout after {secs} seconds"));
        } else {
            self.sink.state(SupervisorState::Failed);
        }

        lifecycle.release();

        match tokio::time::timeout(self.stderr_grace, &mut stderr_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "stderr reader failed"),
            Err(_) => {
                tracing::warn!("stderr still open after startosinstall exited");
                stderr_task.abort();
            }
        }
        if let Ok(mut lines) = stderr_lines.lock() {
            session.output.append(&mut lines);
        }

        self.sink.event(&ProgressEvent::Status(format!(
            "Starting macOS install failed with return code {code}"
        )));
        let separator = "-".repeat(SEPARATOR_WIDTH);
        self.sink.error(&separator);
        for line in &session.output {
            self.sink.error(line);
        }
        self.sink.error(&separator);

        if timed_out {
            Err(StartOsInstallError::TimedOut {
                secs,
                return_code: code,
            })
        } else {
            Err(StartOsInstallError::Failed { return_code: code })
        }
    }
}
