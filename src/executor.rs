//! Test run executor
//!
//! Launches `go test` for a [`TestParams`] snapshot, streams its output line by
//! line and supports two-phase cancellation (interrupt, then kill after a grace
//! period).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunSettings;
use crate::state::TestParams;

/// Where executor output lines are pushed. Bounded; a full sink pauses the reader.
pub type LineSink = mpsc::Sender<OutputLine>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of test process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub run_id: Uuid,
    pub stream: Stream,
    pub text: String,
}

/// Outcome of a single run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    /// `None` when the process was killed by a signal or never started
    pub exit_code: Option<i32>,
    pub passed: bool,
    /// Terminated on request before it could complete
    pub cancelled: bool,
    pub output: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn completed(
        run_id: Uuid,
        exit_code: Option<i32>,
        output: Vec<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            run_id,
            exit_code,
            passed: exit_code == Some(0),
            cancelled: false,
            output,
            started_at,
            duration_ms,
            error: None,
        }
    }

    pub fn cancelled(
        run_id: Uuid,
        exit_code: Option<i32>,
        output: Vec<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            run_id,
            exit_code,
            passed: false,
            cancelled: true,
            output,
            started_at,
            duration_ms,
            error: None,
        }
    }

    /// A run whose process could not be started
    pub fn launch_failed(run_id: Uuid, error: &LaunchError) -> Self {
        Self {
            run_id,
            exit_code: None,
            passed: false,
            cancelled: false,
            output: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("working directory {0} does not exist or is not a directory")]
    InvalidCwd(PathBuf),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("test process has no {0} pipe")]
    MissingPipe(&'static str),
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// The run could not start; reported as a failed run
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The system cannot create processes at all
    #[error("process resources exhausted: {0}")]
    Exhausted(#[source] io::Error),
}

impl ExecError {
    fn from_spawn(program: &Path, err: io::Error) -> Self {
        if is_exhaustion(&err) {
            return ExecError::Exhausted(err);
        }
        ExecError::Launch(LaunchError::Spawn {
            program: program.display().to_string(),
            source: err,
        })
    }
}

fn is_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::ENOMEM))
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Starts test runs. Single-flight is the caller's job.
pub trait Executor: Send + Sync {
    fn start(
        &self,
        run_id: Uuid,
        params: &TestParams,
        cwd: &Path,
        sink: LineSink,
    ) -> Result<RunHandle, ExecError>;
}

/// Handle to one in-flight (or finished) run
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<RunResult>>,
    result: Option<RunResult>,
}

impl RunHandle {
    /// `task` must resolve once the run has exited, and should watch the
    /// receiver side of `cancel_tx` for `true` (or a closed channel).
    pub fn new(run_id: Uuid, cancel_tx: watch::Sender<bool>, task: JoinHandle<RunResult>) -> Self {
        Self {
            run_id,
            cancel_tx,
            task: Some(task),
            result: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Ask the run to stop without waiting for it
    pub fn request_cancel(&self) {
        if self.result.is_none() {
            self.cancel_tx.send_replace(true);
        }
    }

    /// Wait for the run to exit. Cancel-safe; the result is cached.
    pub async fn wait(&mut self) -> RunResult {
        if let Some(ref result) = self.result {
            return result.clone();
        }

        let result = match self.task.as_mut() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "run supervisor task failed");
                    RunResult {
                        error: Some(format!("run supervisor failed: {}", e)),
                        ..RunResult::cancelled(self.run_id, None, Vec::new(), Utc::now(), 0)
                    }
                }
            },
            None => RunResult::cancelled(self.run_id, None, Vec::new(), Utc::now(), 0),
        };

        self.task = None;
        self.result = Some(result.clone());
        result
    }

    /// Request cancellation and wait until the process has exited.
    ///
    /// On a finished run this returns the existing result unchanged.
    pub async fn cancel(&mut self) -> RunResult {
        self.request_cancel();
        self.wait().await
    }
}

/// Runs `go test` as a child process
pub struct GoTestExecutor {
    settings: RunSettings,
}

impl GoTestExecutor {
    pub fn new(settings: RunSettings) -> Self {
        Self { settings }
    }

    /// Arguments passed to the go binary
    pub fn command_args(&self, params: &TestParams) -> Vec<String> {
        let mut args = vec!["test".to_string()];

        if self.settings.json {
            args.push("-json".to_string());
        }
        if self.settings.no_cache {
            args.push("-count=1".to_string());
        }
        if params.race {
            args.push("-race".to_string());
        }
        if params.verbose {
            args.push("-v".to_string());
        }
        if let Some(ref filter) = params.run {
            args.push("-run".to_string());
            args.push(filter.clone());
        }

        args.push(params.pkg.clone());
        args
    }
}

impl Executor for GoTestExecutor {
    fn start(
        &self,
        run_id: Uuid,
        params: &TestParams,
        cwd: &Path,
        sink: LineSink,
    ) -> Result<RunHandle, ExecError> {
        if !cwd.is_dir() {
            return Err(LaunchError::InvalidCwd(cwd.to_path_buf()).into());
        }

        let args = self.command_args(params);
        let program = &self.settings.go;

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so an interrupt reaches the compiled test binaries too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::from_spawn(program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe("stderr"))?;

        info!(
            %run_id,
            pid = child.id(),
            cwd = %cwd.display(),
            args = %args.join(" "),
            "started test process"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let supervisor = Supervisor {
            run_id,
            grace: self.settings.grace_period(),
            output: Arc::new(Mutex::new(OutputBuffer::new(self.settings.retained_lines))),
            sink,
        };

        let task = tokio::spawn(supervisor.run(child, stdout, stderr, cancel_rx));

        Ok(RunHandle::new(run_id, cancel_tx, task))
    }
}

/// Last `limit` lines of a run
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    limit: usize,
    dropped: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.limit == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    fn take(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

struct Supervisor {
    run_id: Uuid,
    grace: Duration,
    output: Arc<Mutex<OutputBuffer>>,
    sink: LineSink,
}

impl Supervisor {
    async fn run<O, E>(
        self,
        mut child: Child,
        stdout: O,
        stderr: E,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> RunResult
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        let readers = [
            tokio::spawn(pump(
                stdout,
                Stream::Stdout,
                self.run_id,
                self.sink.clone(),
                Arc::clone(&self.output),
            )),
            tokio::spawn(pump(
                stderr,
                Stream::Stderr,
                self.run_id,
                self.sink.clone(),
                Arc::clone(&self.output),
            )),
        ];

        let (status, cancelled) = tokio::select! {
            status = child.wait() => (status, false),
            () = cancel_requested(&mut cancel_rx) => (terminate(&mut child, self.grace).await, true),
        };

        for reader in readers {
            if tokio::time::timeout(self.grace, reader).await.is_err() {
                warn!(run_id = %self.run_id, "output pipe still open after process exit, abandoning reader");
            }
        }

        let exit_code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "failed to reap test process");
                None
            }
        };

        let (output, dropped) = {
            let mut buffer = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            (buffer.take(), buffer.dropped)
        };
        if dropped > 0 {
            debug!(run_id = %self.run_id, dropped, "older output lines not retained in run result");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(run_id = %self.run_id, ?exit_code, cancelled, duration_ms, "test process exited");

        if cancelled {
            RunResult::cancelled(self.run_id, exit_code, output, started_at, duration_ms)
        } else {
            RunResult::completed(self.run_id, exit_code, output, started_at, duration_ms)
        }
    }
}

/// Resolves once cancellation is requested or the handle is gone
async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

/// Interrupt, then kill if the process outlives the grace period
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    interrupt(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                pid = child.id(),
                grace_ms = grace.as_millis() as u64,
                "test process ignored interrupt, forcing termination"
            );
            force_kill(child);
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if !signal_group(child, libc::SIGINT) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // Negative pid addresses the process group created at spawn
    let res = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    res == 0
}

/// Forward lines from a pipe to the sink and the retained buffer
async fn pump<R>(
    reader: R,
    stream: Stream,
    run_id: Uuid,
    sink: LineSink,
    output: Arc<Mutex<OutputBuffer>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut sink_open = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();

                output
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(text.clone());

                // Keep draining after the consumer goes away so the child never blocks on a full pipe
                if sink_open && sink.send(OutputLine { run_id, stream, text }).await.is_err() {
                    sink_open = false;
                }
            }
            Err(e) => {
                warn!(%run_id, ?stream, error = %e, "error reading test output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RunSettings {
        RunSettings {
            grace_period_ms: 300,
            ..RunSettings::default()
        }
    }

    #[test]
    fn test_command_args() {
        let executor = GoTestExecutor::new(settings());

        let params = TestParams {
            pkg: "./...".to_string(),
            verbose: true,
            race: true,
            run: Some("TestStore/get".to_string()),
        };
        assert_eq!(
            executor.command_args(&params),
            vec!["test", "-count=1", "-race", "-v", "-run", "TestStore/get", "./..."]
        );

        let params = TestParams {
            pkg: ".".to_string(),
            verbose: false,
            race: false,
            run: None,
        };
        assert_eq!(executor.command_args(&params), vec!["test", "-count=1", "."]);
    }

    #[test]
    fn test_command_args_json_and_cache() {
        let executor = GoTestExecutor::new(RunSettings {
            json: true,
            no_cache: false,
            ..settings()
        });
        let params = TestParams::for_package("./store");
        assert_eq!(executor.command_args(&params), vec!["test", "-json", "-v", "./store"]);
    }

    #[test]
    fn test_output_buffer_keeps_latest() {
        let mut buffer = OutputBuffer::new(2);
        for line in ["a", "b", "c"] {
            buffer.push(line.to_string());
        }
        assert_eq!(buffer.dropped, 1);
        assert_eq!(buffer.take(), vec!["b", "c"]);
    }

    #[test]
    fn test_launch_failed_result() {
        let id = Uuid::new_v4();
        let result = RunResult::launch_failed(id, &LaunchError::InvalidCwd(PathBuf::from("/nope")));
        assert!(!result.passed);
        assert!(!result.cancelled);
        assert!(result.output.is_empty());
        assert!(result.error.unwrap().contains("/nope"));
    }

    #[tokio::test]
    async fn test_invalid_cwd_is_launch_error() {
        let executor = GoTestExecutor::new(settings());
        let (tx, _rx) = mpsc::channel(8);
        let err = executor
            .start(Uuid::new_v4(), &TestParams::default(), Path::new("/definitely/not/here"), tx)
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch(LaunchError::InvalidCwd(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = GoTestExecutor::new(RunSettings {
            go: dir.path().join("no-such-go"),
            ..settings()
        });
        let (tx, _rx) = mpsc::channel(8);
        let err = executor
            .start(Uuid::new_v4(), &TestParams::default(), dir.path(), tx)
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch(LaunchError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_cancel_finished_handle_is_noop() {
        let id = Uuid::new_v4();
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            RunResult::completed(id, Some(0), vec!["ok".to_string()], Utc::now(), 1)
        });
        let mut handle = RunHandle::new(id, cancel_tx, task);

        let first = handle.wait().await;
        assert!(first.passed);

        let again = handle.cancel().await;
        assert_eq!(again, first);
        assert!(!again.cancelled);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Writes an executable stand-in for the go binary
        fn fake_go(dir: &Path, script: &str) -> PathBuf {
            let path = dir.join("go");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn executor(go: PathBuf) -> GoTestExecutor {
            GoTestExecutor::new(RunSettings { go, ..settings() })
        }

        async fn collect(mut rx: mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        }

        #[tokio::test]
        async fn test_streams_output_and_passes() {
            let dir = tempfile::tempdir().unwrap();
            let go = fake_go(dir.path(), "echo \"=== RUN   TestOne\"\necho \"--- PASS: TestOne\"\necho warning >&2\nexit 0");
            let (tx, rx) = mpsc::channel(8);
            let id = Uuid::new_v4();

            let mut handle = executor(go)
                .start(id, &TestParams::default(), dir.path(), tx)
                .unwrap();
            let result = handle.wait().await;
            drop(handle);
            let lines = collect(rx).await;

            assert!(result.passed);
            assert!(!result.cancelled);
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(result.output.len(), 3);
            assert!(lines.iter().all(|l| l.run_id == id));
            assert!(lines
                .iter()
                .any(|l| l.stream == Stream::Stderr && l.text == "warning"));
            assert!(lines
                .iter()
                .any(|l| l.stream == Stream::Stdout && l.text == "--- PASS: TestOne"));
        }

        #[tokio::test]
        async fn test_failure_is_not_cancellation() {
            let dir = tempfile::tempdir().unwrap();
            let go = fake_go(dir.path(), "echo FAIL\nexit 1");
            let (tx, _rx) = mpsc::channel(8);

            let mut handle = executor(go)
                .start(Uuid::new_v4(), &TestParams::default(), dir.path(), tx)
                .unwrap();
            let result = handle.wait().await;

            assert_eq!(result.exit_code, Some(1));
            assert!(!result.passed);
            assert!(!result.cancelled);
        }

        #[tokio::test]
        async fn test_cancel_interrupts_running_process() {
            let dir = tempfile::tempdir().unwrap();
            let go = fake_go(dir.path(), "echo started\nsleep 30");
            let (tx, mut rx) = mpsc::channel(8);

            let mut handle = executor(go)
                .start(Uuid::new_v4(), &TestParams::default(), dir.path(), tx)
                .unwrap();
            assert_eq!(rx.recv().await.unwrap().text, "started");

            let started = Instant::now();
            let result = handle.cancel().await;

            assert!(result.cancelled);
            assert!(!result.passed);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_cancel_escalates_when_interrupt_ignored() {
            let dir = tempfile::tempdir().unwrap();
            let go = fake_go(dir.path(), "trap '' INT\necho started\nsleep 30");
            let (tx, mut rx) = mpsc::channel(8);

            let mut handle = executor(go)
                .start(Uuid::new_v4(), &TestParams::default(), dir.path(), tx)
                .unwrap();
            assert_eq!(rx.recv().await.unwrap().text, "started");

            let result = handle.cancel().await;
            assert!(result.cancelled);
            assert_eq!(result.exit_code, None);

            // Idempotent once exited
            let again = handle.cancel().await;
            assert_eq!(again, result);
        }

        #[tokio::test]
        async fn test_passes_arguments_and_cwd() {
            let dir = tempfile::tempdir().unwrap();
            let go = fake_go(dir.path(), "echo \"$@\"\npwd");
            let (tx, rx) = mpsc::channel(8);
            let params = TestParams {
                pkg: "./store".to_string(),
                verbose: false,
                race: true,
                run: Some("TestGet".to_string()),
            };

            let mut handle = executor(go)
                .start(Uuid::new_v4(), &params, dir.path(), tx)
                .unwrap();
            let result = handle.wait().await;
            drop(handle);
            let _ = collect(rx).await;

            assert_eq!(result.output[0], "test -count=1 -race -run TestGet ./store");
            let cwd = std::fs::canonicalize(dir.path()).unwrap();
            assert_eq!(std::fs::canonicalize(&result.output[1]).unwrap(), cwd);
        }
    }
}
