//! Scripted stand-ins for the executor, discovery and watcher

use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::discovery::{Discovery, DiscoveryError};
use crate::executor::{ExecError, Executor, LaunchError, LineSink, OutputLine, RunHandle, RunResult, Stream};
use crate::state::{Package, TestParams};
use crate::watcher::{ChangeSignal, Subscription, WatchBackend, WatchError};

enum LaunchFailure {
    Launch,
    Exhausted,
}

struct FakeRun {
    finish: Option<oneshot::Sender<i32>>,
    release: Option<oneshot::Sender<()>>,
    sink: LineSink,
}

#[derive(Default)]
struct ExecutorState {
    launches: Vec<TestParams>,
    runs: HashMap<Uuid, FakeRun>,
    hold_cancels: bool,
    fail_next: Option<LaunchFailure>,
}

/// Runs that last until the test finishes or cancels them
#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<ExecutorState>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl FakeExecutor {
    /// Params of every launched run, in order
    pub fn launches(&self) -> Vec<TestParams> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Complete the run with `exit_code`
    pub fn finish(&self, run_id: Uuid, exit_code: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.runs.get_mut(&run_id).and_then(|r| r.finish.take()) {
            let _ = tx.send(exit_code);
        }
    }

    /// Push one stdout line for the run
    pub async fn emit(&self, run_id: Uuid, text: &str) {
        let sink = self.state.lock().unwrap().runs[&run_id].sink.clone();
        sink.send(OutputLine {
            run_id,
            stream: Stream::Stdout,
            text: text.to_string(),
        })
        .await
        .unwrap();
    }

    /// Cancelled runs started from now on stay alive until released
    pub fn hold_cancels(&self) {
        self.state.lock().unwrap().hold_cancels = true;
    }

    pub fn release(&self, run_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.runs.get_mut(&run_id).and_then(|r| r.release.take()) {
            let _ = tx.send(());
        }
    }

    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.hold_cancels = false;
        for run in state.runs.values_mut() {
            if let Some(tx) = run.release.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn fail_next_launch(&self) {
        self.state.lock().unwrap().fail_next = Some(LaunchFailure::Launch);
    }

    pub fn exhaust_next_launch(&self) {
        self.state.lock().unwrap().fail_next = Some(LaunchFailure::Exhausted);
    }
}

impl Executor for FakeExecutor {
    fn start(
        &self,
        run_id: Uuid,
        params: &TestParams,
        cwd: &Path,
        sink: LineSink,
    ) -> Result<RunHandle, ExecError> {
        let mut state = self.state.lock().unwrap();

        match state.fail_next.take() {
            Some(LaunchFailure::Launch) => {
                return Err(LaunchError::InvalidCwd(cwd.to_path_buf()).into());
            }
            Some(LaunchFailure::Exhausted) => {
                return Err(ExecError::Exhausted(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "fork failed",
                )));
            }
            None => {}
        }

        state.launches.push(params.clone());
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);

        let (finish_tx, finish_rx) = oneshot::channel::<i32>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let hold = state.hold_cancels;
        let live = Arc::clone(&self.live);

        let task = tokio::spawn(async move {
            let started_at = Utc::now();
            let exit_code = tokio::select! {
                code = finish_rx => code.ok(),
                () = cancelled(&mut cancel_rx) => None,
            };

            let result = match exit_code {
                Some(code) => RunResult::completed(run_id, Some(code), Vec::new(), started_at, 0),
                None => {
                    if hold {
                        let _ = release_rx.await;
                    }
                    RunResult::cancelled(run_id, None, Vec::new(), started_at, 0)
                }
            };

            live.fetch_sub(1, Ordering::SeqCst);
            result
        });

        state.runs.insert(
            run_id,
            FakeRun {
                finish: Some(finish_tx),
                release: Some(release_tx),
                sink,
            },
        );

        Ok(RunHandle::new(run_id, cancel_tx, task))
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Discovery returning whatever the test set last
pub struct FakeDiscovery {
    next: Mutex<Result<Vec<Package>, String>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl Default for FakeDiscovery {
    fn default() -> Self {
        Self {
            next: Mutex::new(Ok(Vec::new())),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeDiscovery {
    pub fn set(&self, next: Result<Vec<Package>, String>) {
        *self.next.lock().unwrap() = next;
    }

    /// Every listing blocks its thread this long, like a cold `go test -list`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Discovery for FakeDiscovery {
    fn list_packages(&self, _cwd: &Path) -> Result<Vec<Package>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        std::thread::sleep(delay);

        self.next
            .lock()
            .unwrap()
            .clone()
            .map_err(|stderr| DiscoveryError::Command {
                status: "exit status: 1".to_string(),
                stderr,
            })
    }
}

#[derive(Default)]
struct WatchState {
    current: Option<(u64, mpsc::Sender<ChangeSignal>)>,
    next_id: u64,
    subscriptions: usize,
    active: usize,
    fail_next: bool,
}

/// Watch backend whose changes are fired by hand
#[derive(Default)]
pub struct ManualWatch {
    state: Arc<Mutex<WatchState>>,
}

impl ManualWatch {
    /// Signal a change; false when nothing is subscribed
    pub fn fire(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.current {
            Some((_, ref tx)) => {
                let _ = tx.try_send(ChangeSignal {
                    paths: vec![PathBuf::from("main.go")],
                });
                true
            }
            None => false,
        }
    }

    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Total subscriptions ever made
    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    /// Subscriptions not yet released
    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

impl WatchBackend for ManualWatch {
    fn subscribe(
        &self,
        root: &Path,
        signals: mpsc::Sender<ChangeSignal>,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.current = Some((id, signals));
        state.subscriptions += 1;
        state.active += 1;

        Ok(Box::new(ManualSubscription {
            id,
            state: Arc::clone(&self.state),
            released: false,
        }))
    }
}

struct ManualSubscription {
    id: u64,
    state: Arc<Mutex<WatchState>>,
    released: bool,
}

impl Subscription for ManualSubscription {
    fn unsubscribe(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.active -= 1;
        if matches!(state.current, Some((id, _)) if id == self.id) {
            state.current = None;
        }
    }
}

impl Drop for ManualSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
