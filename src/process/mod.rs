//! External Process Supervision
//!
//! The [`ProcessRunner`] starts one scan tool invocation per Task and owns
//! it until exit:
//!
//! - the child runs in its own process group
//! - stdout and stderr are streamed line by line into the log artifact
//! - the exit is reported exactly once, after the log has been flushed
//! - termination escalates SIGTERM -> SIGKILL and sweeps escaped descendants
//!
//! # Example
//!
//! ```rust,no_run
//! use scanrunner::process::{LaunchSpec, ProcessRunner};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let runner = ProcessRunner::new(Duration::from_secs(5));
//! let spec = LaunchSpec::new("xmap", "/tmp/scan.log").args(["-6", "-M", "icmp_echo"]);
//! let (handle, exit) = runner.spawn(spec)?;
//! println!("started pid {:?}", handle.pid());
//! let report = exit.wait().await;
//! println!("{}", report.describe());
//! # Ok(())
//! # }
//! ```

mod reaper;

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Number of stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 5;

/// How long to wait for output pipes to drain after the process exits.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to start one process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// File that receives the process's stdout and stderr.
    pub log_path: PathBuf,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            log_path: log_path.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// The full argv, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    /// True if the exit followed a termination request.
    pub terminated: bool,
    /// Last lines the process wrote to stderr.
    pub stderr_tail: Vec<String>,
    /// Supervision failure, e.g. the exit status could not be collected.
    pub fault: Option<String>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.fault.is_none() && self.code == Some(0)
    }

    /// A one-line summary suitable for a Task's error message.
    pub fn describe(&self) -> String {
        let mut message = match (&self.fault, self.code, self.signal) {
            (Some(fault), _, _) => format!("supervision fault: {}", fault),
            (None, Some(0), _) => "process exited successfully".to_string(),
            (None, Some(code), _) => format!("process exited with code {}", code),
            (None, None, Some(signal)) => format!("process killed by signal {}", signal),
            (None, None, None) => "process exited with unknown status".to_string(),
        };

        if !self.success() && !self.stderr_tail.is_empty() {
            message.push_str(": ");
            message.push_str(&self.stderr_tail.join(" | "));
        }
        message
    }

    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
                ..Self::default()
            },
            Err(e) => Self {
                fault: Some(e.to_string()),
                ..Self::default()
            },
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Control handle for a running process.
///
/// Terminating after the process has exited is a no-op.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests termination of the process and all its descendants.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

/// Resolves once the process has exited and its log is flushed.
#[derive(Debug)]
pub struct ExitWaiter {
    rx: oneshot::Receiver<ExitReport>,
}

impl ExitWaiter {
    pub async fn wait(self) -> ExitReport {
        self.rx.await.unwrap_or_else(|_| ExitReport {
            fault: Some("process supervisor stopped unexpectedly".to_string()),
            ..ExitReport::default()
        })
    }
}

/// Spawns and supervises external processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    /// `kill_grace` is the time between SIGTERM and SIGKILL on termination.
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Starts a process. Must be called from within a Tokio runtime.
    ///
    /// Returns once the process is running; the exit is delivered through
    /// the [`ExitWaiter`].
    pub fn spawn(&self, spec: LaunchSpec) -> Result<(ProcessHandle, ExitWaiter), RunnerError> {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|source| RunnerError::Log {
                path: spec.log_path.clone(),
                source,
            })?;

        let mut command = std::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so termination reaches every child
            command.process_group(0);
        }

        let mut child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!("Started {} (pid {:?})", spec.program, pid);
        debug!("Command: {}", spec.argv().join(" "));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let supervisor = Supervisor {
            child,
            log: tokio::fs::File::from_std(log_file),
            cancel: cancel.clone(),
            kill_grace: self.kill_grace,
            program: spec.program,
        };
        tokio::spawn(async move {
            let report = supervisor.run(stdout, stderr).await;
            // The receiver may be gone if nobody cares about the exit
            let _ = tx.send(report);
        });

        Ok((ProcessHandle { pid, cancel }, ExitWaiter { rx }))
    }
}

type SharedLog = Arc<tokio::sync::Mutex<BufWriter<tokio::fs::File>>>;

struct Supervisor {
    child: Child,
    log: tokio::fs::File,
    cancel: CancellationToken,
    kill_grace: Duration,
    program: String,
}

impl Supervisor {
    async fn run(
        mut self,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) -> ExitReport {
        let log: SharedLog = Arc::new(tokio::sync::Mutex::new(BufWriter::new(self.log)));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let mut pumps = Vec::new();
        if let Some(stdout) = stdout {
            pumps.push(tokio::spawn(pump(stdout, log.clone(), None)));
        }
        if let Some(stderr) = stderr {
            pumps.push(tokio::spawn(pump(stderr, log.clone(), Some(tail.clone()))));
        }

        let mut terminated = false;
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = self.cancel.cancelled() => {
                terminated = true;
                info!("Terminating {} (pid {:?})", self.program, self.child.id());
                reaper::terminate(&mut self.child, self.kill_grace).await
            }
        };

        // Pipes close once every process holding them has exited
        for mut handle in pumps {
            if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Output of {} did not close; detaching", self.program);
                handle.abort();
            }
        }

        {
            let mut writer = log.lock().await;
            if let Err(e) = writer.flush().await {
                warn!("Failed to flush log of {}: {}", self.program, e);
            }
            if let Err(e) = writer.get_mut().sync_data().await {
                debug!("Failed to sync log of {}: {}", self.program, e);
            }
        }

        let mut report = ExitReport::from_status(status);
        report.terminated = terminated;
        report.stderr_tail = tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();

        debug!("{} exited: {}", self.program, report.describe());
        report
    }
}

/// Copies one output stream into the log, line by line.
async fn pump<R>(stream: R, log: SharedLog, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        }

        {
            let mut writer = log.lock().await;
            if writer.write_all(&line).await.is_err() {
                break;
            }
            if !line.ends_with(b"\n") && writer.write_all(b"\n").await.is_err() {
                break;
            }
        }

        if let Some(tail) = &tail {
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if text.is_empty() {
                continue;
            }
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(text);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn sh(script: &str, log: &std::path::Path) -> LaunchSpec {
        LaunchSpec::new("/bin/sh", log).args(["-c", script])
    }

    /// Zombies still answer kill(pid, 0), so look at the process state too.
    fn is_running(pid: i32) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.contains(") Z "),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_log_capture() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("run.log");
        let runner = ProcessRunner::new(Duration::from_secs(1));

        let (_, exit) = runner
            .spawn(sh("echo hello; echo oops >&2; exit 3", &log))
            .unwrap();
        let report = exit.wait().await;

        assert_eq!(report.code, Some(3));
        assert!(!report.success());
        assert!(!report.terminated);
        assert_eq!(report.stderr_tail, vec!["oops".to_string()]);
        assert!(report.describe().contains("code 3"));

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[tokio::test]
    async fn test_successful_exit() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("ok.log");
        let runner = ProcessRunner::new(Duration::from_secs(1));

        let (handle, exit) = runner.spawn(sh("exit 0", &log)).unwrap();
        assert!(handle.pid().is_some());
        let report = exit.wait().await;
        assert!(report.success());

        // Terminating after exit is harmless
        handle.terminate();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(1));
        let spec = LaunchSpec::new("/nonexistent/xmap", dir.path().join("x.log"));

        let result = runner.spawn(spec);
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_group() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("long.log");
        let marker = dir.path().join("child.pid");
        let runner = ProcessRunner::new(Duration::from_secs(2));

        let script = format!("sleep 30 & echo $! > {}; wait", marker.display());
        let (handle, exit) = runner.spawn(sh(&script, &log)).unwrap();

        // Wait for the background child to be recorded
        let started = Instant::now();
        while !marker.exists() && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let child_pid: i32 = std::fs::read_to_string(&marker)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        handle.terminate();
        let report = exit.wait().await;
        assert!(report.terminated);
        assert!(!report.success());

        // The grandchild must be gone too (allow the kernel a moment)
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!is_running(child_pid), "background child survived termination");
    }
}
