//! Child process runner with timeout and process-tree kill.
//!
//! Each process runs in its own process group (a new process group on
//! Windows) so that on timeout or cancellation the whole tree can be
//! killed, not just the direct child.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment variables passed through by default.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "USER",
    "TMPDIR",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "SYSTEMROOT",
    "USERPROFILE",
    "TEMP",
    "TMP",
    "PATHEXT",
    "COMSPEC",
];

/// Output captured per stream before truncating.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Process errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Failed to spawn process.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Process exceeded its time limit and was killed.
    #[error("{name} timed out after {duration:?}")]
    Timeout {
        /// Logical name (usually the tool).
        name: String,
        /// Configured limit.
        duration: Duration,
    },

    /// Cancelled; the process tree was killed.
    #[error("Process cancelled")]
    Cancelled,

    /// I/O error while waiting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Logical name used in errors and logs.
    pub name: String,
    /// Executable.
    pub program: String,
    /// Arguments, passed without a shell.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit.
    pub timeout: Duration,
    /// Variables copied from the parent environment; all others are cleared.
    pub env_allowlist: Vec<String>,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
}

impl ProcessSpec {
    /// Create a spec with default limits.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            working_dir: None,
            timeout: Duration::from_secs(120),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| (*s).to_string()).collect(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the environment allowlist.
    #[must_use]
    pub fn with_env_allowlist(mut self, vars: Vec<String>) -> Self {
        self.env_allowlist = vars;
        self
    }

    /// Set the per-stream capture limit.
    #[must_use]
    pub const fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Standard output (lossy UTF-8).
    pub stdout: String,
    /// Standard error (lossy UTF-8).
    pub stderr: String,
    /// Exit code, `None` if killed by a signal.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether either stream hit the capture limit.
    pub truncated: bool,
}

impl ProcessOutput {
    /// Whether the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, for tool output.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n--- stderr ---\n{}", self.stdout, self.stderr),
        }
    }
}

enum Exit {
    Finished(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run a process to completion, killing its tree on timeout or cancellation.
///
/// # Errors
///
/// Returns `Spawn` if the program cannot start, `Timeout` or `Cancelled` if
/// it was killed, and `Io` if waiting fails.
pub async fn run_process(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env_clear();
    for var in &spec.env_allowlist {
        if let Some(value) = std::env::var_os(var) {
            command.env(var, value);
        }
    }
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(windows)]
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);

    tracing::debug!(name = %spec.name, program = %spec.program, args = ?spec.args, "Spawning process");
    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .map(|s| tokio::spawn(read_capped(s, spec.max_output_bytes)));
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_capped(s, spec.max_output_bytes)));

    let exit = tokio::select! {
        biased;
        () = cancel.cancelled() => Exit::Cancelled,
        () = tokio::time::sleep(spec.timeout) => Exit::TimedOut,
        status = child.wait() => Exit::Finished(status),
    };

    let status = match exit {
        Exit::Finished(status) => status?,
        Exit::TimedOut => {
            tracing::warn!(name = %spec.name, timeout = ?spec.timeout, "Process timed out, killing tree");
            kill_tree(&mut child).await;
            abort_readers([stdout, stderr]);
            return Err(ProcessError::Timeout {
                name: spec.name.clone(),
                duration: spec.timeout,
            });
        }
        Exit::Cancelled => {
            tracing::info!(name = %spec.name, "Process cancelled, killing tree");
            kill_tree(&mut child).await;
            abort_readers([stdout, stderr]);
            return Err(ProcessError::Cancelled);
        }
    };

    let (stdout, stdout_truncated) = collect(stdout).await;
    let (stderr, stderr_truncated) = collect(stderr).await;
    let duration = started.elapsed();
    tracing::debug!(
        name = %spec.name,
        exit_code = ?status.code(),
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "Process finished"
    );

    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        duration,
        truncated: stdout_truncated || stderr_truncated,
    })
}

/// Read a stream to the end, keeping at most `max` bytes.
///
/// Keeps draining past the limit so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> (String, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0_u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

async fn collect(handle: Option<JoinHandle<(String, bool)>>) -> (String, bool) {
    let Some(mut handle) = handle else {
        return (String::new(), false);
    };
    // A detached grandchild may hold the pipe open after the child exits.
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            handle.abort();
            (String::new(), true)
        }
    }
}

fn abort_readers(handles: [Option<JoinHandle<(String, bool)>>; 2]) {
    for handle in handles.into_iter().flatten() {
        handle.abort();
    }
}

/// Kill the child's whole process tree, then the child itself.
async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(pid) {
                if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                    tracing::debug!(pid, error = %e, "killpg failed");
                }
            }
        }
        #[cfg(windows)]
        {
            let result = Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = result {
                tracing::debug!(pid, error = %e, "taskkill failed");
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already exited");
    }
}
