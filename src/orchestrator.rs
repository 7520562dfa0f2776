//! Test run orchestrator
//!
//! A single task owns the run slot, the watch subscription and all writes to
//! [`State`]. Intents from the host, debounced change signals from the watcher,
//! output lines and run exits all converge on one `select!` loop and are handled
//! one at a time, in arrival order.
//!
//! ```text
//!            StartRun / change              exit
//!   Idle ─────────────────────▶ Running ───────────▶ Idle
//!                                  │
//!                      Stop / change (watching)
//!                                  ▼
//!                             Cancelling ──exit──▶ Idle, or Running again
//!                                                  if a restart is pending
//! ```
//!
//! Cancelling never blocks the loop: the cancel request goes out and the exit
//! comes back later as an ordinary loop event, while output keeps draining.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{package_choices, Discovery, DiscoveryError};
use crate::events::{Event, EventBus};
use crate::executor::{ExecError, Executor, OutputLine, RunHandle, RunResult};
use crate::state::{Package, State, StateStore, TestParams};
use crate::watcher::{ChangeSignal, Subscription, WatchBackend};

const INTENT_QUEUE: usize = 64;

type Listing = JoinHandle<Result<Vec<Package>, DiscoveryError>>;

/// Requests from the host (UI or CLI)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    SetCwd(PathBuf),
    SetTestParams(TestParams),
    StartRun,
    Stop,
    ToggleWatch(bool),
    RefreshPackageList,
    /// Cancel any run, release the watcher and end the loop
    Shutdown,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot start test processes: {0}")]
    Fatal(#[source] ExecError),
    #[error("orchestrator is no longer running")]
    Closed,
    #[error("orchestrator task failed: {0}")]
    Join(#[from] JoinError),
}

struct ActiveRun {
    handle: RunHandle,
    params: TestParams,
}

enum Phase {
    Idle,
    Running(ActiveRun),
    Cancelling {
        run: ActiveRun,
        /// Publish the result once it exits (user stop) or drop it (restart)
        report: bool,
    },
}

impl Phase {
    fn active_mut(&mut self) -> Option<&mut ActiveRun> {
        match self {
            Phase::Idle => None,
            Phase::Running(run) | Phase::Cancelling { run, .. } => Some(run),
        }
    }

    /// Whether lines from `run_id` should reach observers
    fn relays(&self, run_id: Uuid) -> bool {
        match self {
            Phase::Running(run) => run.handle.run_id() == run_id,
            Phase::Cancelling { run, report } => *report && run.handle.run_id() == run_id,
            Phase::Idle => false,
        }
    }
}

pub struct Orchestrator {
    config: Config,
    store: Arc<StateStore>,
    bus: EventBus,
    executor: Arc<dyn Executor>,
    discovery: Arc<dyn Discovery>,
    watcher: Arc<dyn WatchBackend>,

    phase: Phase,
    /// At most one restart is remembered while cancelling; the latest trigger decides
    pending_restart: bool,
    subscription: Option<Box<dyn Subscription>>,
    signals: Option<mpsc::Receiver<ChangeSignal>>,
    lines_tx: mpsc::Sender<OutputLine>,
    lines_rx: mpsc::Receiver<OutputLine>,
    /// Discovery runs off the loop; at most one more is queued behind it
    listing: Option<Listing>,
    relist: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        initial: State,
        executor: Arc<dyn Executor>,
        discovery: Arc<dyn Discovery>,
        watcher: Arc<dyn WatchBackend>,
    ) -> Self {
        let (lines_tx, lines_rx) = mpsc::channel(config.run.output_buffer.max(1));
        let bus = EventBus::new(config.events.capacity);

        // Flags describe live resources, which do not exist yet
        let initial = State {
            watching: false,
            running: false,
            ..initial
        };

        Self {
            config,
            store: Arc::new(StateStore::new(initial)),
            bus,
            executor,
            discovery,
            watcher,
            phase: Phase::Idle,
            pending_restart: false,
            subscription: None,
            signals: None,
            lines_tx,
            lines_rx,
            listing: None,
            relist: false,
        }
    }

    /// Start the loop on the current tokio runtime
    pub fn spawn(self) -> OrchestratorHandle {
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_QUEUE);
        let store = Arc::clone(&self.store);
        let bus = self.bus.clone();
        let task = tokio::spawn(self.run(intents_rx));

        OrchestratorHandle {
            intents: intents_tx,
            store,
            bus,
            task,
        }
    }

    async fn run(mut self, mut intents: mpsc::Receiver<Intent>) -> Result<(), OrchestratorError> {
        debug!("orchestrator started");

        let outcome = loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break Ok(()),
                    Some(intent) => {
                        if let Err(e) = self.handle_intent(intent) {
                            break Err(e);
                        }
                    }
                },
                Some(signal) = next_signal(&mut self.signals) => {
                    if let Err(e) = self.on_change(signal) {
                        break Err(e);
                    }
                }
                Some(line) = self.lines_rx.recv() => self.relay(line),
                result = run_exit(&mut self.phase) => {
                    if let Err(e) = self.on_exit(result) {
                        break Err(e);
                    }
                }
                listed = listing_done(&mut self.listing) => self.on_listed(listed),
            }
        };

        self.shutdown().await;
        debug!("orchestrator stopped");
        outcome
    }

    fn handle_intent(&mut self, intent: Intent) -> Result<(), OrchestratorError> {
        debug!(?intent, "intent");

        match intent {
            Intent::SetCwd(path) => self.set_cwd(path),
            Intent::SetTestParams(params) => self.set_test_params(params),
            Intent::StartRun => return self.on_start_request(),
            Intent::Stop => self.on_stop(),
            Intent::ToggleWatch(on) => return self.toggle_watch(on),
            Intent::RefreshPackageList => self.refresh_packages(),
            Intent::Shutdown => {}
        }

        Ok(())
    }

    fn set_cwd(&mut self, path: PathBuf) {
        if !path.is_dir() {
            self.reject(format!("{} is not a directory", path.display()));
            return;
        }

        let path = std::fs::canonicalize(&path).unwrap_or(path);
        let state = self.store.update(|s| s.cwd = path.clone());
        info!(cwd = %path.display(), "working directory changed");

        // A listing in flight describes the old directory
        if self.listing.is_some() {
            self.relist = true;
        }

        if state.watching {
            self.unsubscribe();
            self.subscribe();
        }

        self.publish_state();
    }

    fn set_test_params(&mut self, params: TestParams) {
        let params = params.normalized();
        if let Err(e) = params.validate() {
            self.reject(format!("invalid test name filter: {}", e));
            return;
        }

        self.store.update(|s| s.test_params = params);
        self.publish_state();
    }

    fn on_start_request(&mut self) -> Result<(), OrchestratorError> {
        match self.phase {
            Phase::Idle => self.start_run(),
            Phase::Running(_) => {
                self.reject("a run is already in progress".to_string());
                Ok(())
            }
            Phase::Cancelling { .. } => {
                self.pending_restart = true;
                Ok(())
            }
        }
    }

    fn on_stop(&mut self) {
        self.pending_restart = false;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => debug!("stop requested with no active run"),
            Phase::Running(run) | Phase::Cancelling { run, .. } => {
                info!(run_id = %run.handle.run_id(), "stopping run");
                run.handle.request_cancel();
                self.phase = Phase::Cancelling { run, report: true };
            }
        }
    }

    fn on_change(&mut self, signal: ChangeSignal) -> Result<(), OrchestratorError> {
        if !self.store.get().watching {
            debug!("change ignored, not watching");
            return Ok(());
        }

        debug!(paths = ?signal.paths, "files changed");

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => self.start_run(),
            Phase::Running(run) => {
                info!(run_id = %run.handle.run_id(), "files changed, restarting run");
                run.handle.request_cancel();
                self.phase = Phase::Cancelling { run, report: false };
                self.pending_restart = true;
                Ok(())
            }
            cancelling @ Phase::Cancelling { .. } => {
                self.phase = cancelling;
                self.pending_restart = true;
                Ok(())
            }
        }
    }

    fn on_exit(&mut self, result: RunResult) -> Result<(), OrchestratorError> {
        // The run's readers have finished, so everything it printed is already queued
        while let Ok(line) = self.lines_rx.try_recv() {
            self.relay(line);
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Running(_) => {
                self.bus.publish(Event::RunFinished(result));
            }
            Phase::Cancelling { run, report } => {
                if report {
                    self.bus.publish(Event::RunFinished(result));
                } else {
                    debug!(
                        run_id = %result.run_id,
                        pkg = %run.params.pkg,
                        lines = result.output.len(),
                        exit_code = ?result.exit_code,
                        "discarded superseded run"
                    );
                }
            }
        }

        if std::mem::take(&mut self.pending_restart) {
            return self.start_run();
        }

        self.store.update(|s| s.running = false);
        self.publish_state();
        Ok(())
    }

    fn toggle_watch(&mut self, on: bool) -> Result<(), OrchestratorError> {
        let watching = self.store.get().watching;

        if on && !watching {
            if self.subscribe() {
                self.publish_state();
                if self.config.watch.run_on_start && matches!(self.phase, Phase::Idle) {
                    return self.start_run();
                }
            }
        } else if !on && watching {
            self.unsubscribe();
            self.publish_state();
        }

        Ok(())
    }

    /// Returns whether the watch is now active
    fn subscribe(&mut self) -> bool {
        let cwd = self.store.get().cwd;
        let (tx, rx) = mpsc::channel(1);

        match self.watcher.subscribe(&cwd, tx) {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.signals = Some(rx);
                self.store.update(|s| s.watching = true);
                true
            }
            Err(e) => {
                warn!(error = %e, "could not start watching");
                self.store.update(|s| s.watching = false);
                self.bus.publish(Event::WatchError {
                    message: e.to_string(),
                });
                self.publish_state();
                false
            }
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.signals = None;
        self.store.update(|s| s.watching = false);
    }

    fn refresh_packages(&mut self) {
        if self.listing.is_some() {
            self.relist = true;
            return;
        }

        let cwd = self.store.get().cwd;
        let discovery = Arc::clone(&self.discovery);
        debug!(cwd = %cwd.display(), "listing packages");
        self.listing = Some(tokio::task::spawn_blocking(move || discovery.list_packages(&cwd)));
    }

    fn on_listed(&mut self, listed: Result<Result<Vec<Package>, DiscoveryError>, JoinError>) {
        self.listing = None;

        match listed {
            Ok(Ok(packages)) => {
                let choices = package_choices(&packages);
                self.store.update(|s| s.pkg_list = choices);
                self.bus.publish(Event::PackagesListed(packages));
                self.publish_state();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "package discovery failed");
                self.bus.publish(Event::DiscoveryError {
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, "package discovery task failed");
                self.bus.publish(Event::DiscoveryError {
                    message: e.to_string(),
                });
            }
        }

        if std::mem::take(&mut self.relist) {
            self.refresh_packages();
        }
    }

    /// Only called while idle
    fn start_run(&mut self) -> Result<(), OrchestratorError> {
        debug_assert!(matches!(self.phase, Phase::Idle), "run slot already taken");

        let snapshot = self.store.get();
        let params = snapshot.test_params.clone();
        let run_id = Uuid::new_v4();

        match self
            .executor
            .start(run_id, &params, &snapshot.cwd, self.lines_tx.clone())
        {
            Ok(handle) => {
                info!(%run_id, pkg = %params.pkg, "run started");
                self.phase = Phase::Running(ActiveRun {
                    handle,
                    params: params.clone(),
                });
                self.store.update(|s| s.running = true);
                self.bus.publish(Event::RunStarted { run_id, params });
                self.publish_state();
                Ok(())
            }
            Err(ExecError::Launch(e)) => {
                warn!(%run_id, error = %e, "could not launch test process");
                self.store.update(|s| s.running = false);
                self.bus
                    .publish(Event::RunFinished(RunResult::launch_failed(run_id, &e)));
                self.publish_state();
                Ok(())
            }
            Err(e @ ExecError::Exhausted(_)) => Err(OrchestratorError::Fatal(e)),
        }
    }

    fn relay(&self, line: OutputLine) {
        if self.phase.relays(line.run_id) {
            self.bus.publish(Event::OutputLine(line));
        }
    }

    fn reject(&self, reason: String) {
        debug!(%reason, "intent rejected");
        self.bus.publish(Event::Rejected { reason });
    }

    fn publish_state(&self) {
        self.bus.publish(Event::StateChanged(self.store.get()));
    }

    async fn shutdown(&mut self) {
        self.unsubscribe();
        self.pending_restart = false;
        self.relist = false;
        // The blocking listing cannot be interrupted; its result is simply never read
        self.listing = None;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Running(mut run) | Phase::Cancelling { mut run, report: true } => {
                info!(run_id = %run.handle.run_id(), "cancelling run for shutdown");
                let result = self.drain_until_exit(&mut run).await;
                self.bus.publish(Event::RunFinished(result));
            }
            Phase::Cancelling { mut run, report: false } => {
                self.drain_until_exit(&mut run).await;
            }
        }

        self.store.update(|s| s.running = false);
        self.publish_state();
    }

    /// Cancel and wait, discarding output so the process can never stall on a full pipe
    async fn drain_until_exit(&mut self, run: &mut ActiveRun) -> RunResult {
        run.handle.request_cancel();
        loop {
            tokio::select! {
                result = run.handle.wait() => return result,
                Some(_) = self.lines_rx.recv() => {}
            }
        }
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<ChangeSignal>>) -> Option<ChangeSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn listing_done(
    listing: &mut Option<Listing>,
) -> Result<Result<Vec<Package>, DiscoveryError>, JoinError> {
    match listing {
        Some(task) => task.await,
        None => pending().await,
    }
}

async fn run_exit(phase: &mut Phase) -> RunResult {
    match phase.active_mut() {
        Some(run) => run.handle.wait().await,
        None => pending().await,
    }
}

/// Host-side handle: send intents, observe events, read state
pub struct OrchestratorHandle {
    intents: mpsc::Sender<Intent>,
    store: Arc<StateStore>,
    bus: EventBus,
    task: JoinHandle<Result<(), OrchestratorError>>,
}

impl OrchestratorHandle {
    pub async fn send(&self, intent: Intent) -> Result<(), OrchestratorError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| OrchestratorError::Closed)
    }

    pub async fn set_cwd(&self, path: impl Into<PathBuf>) -> Result<(), OrchestratorError> {
        self.send(Intent::SetCwd(path.into())).await
    }

    pub async fn set_test_params(&self, params: TestParams) -> Result<(), OrchestratorError> {
        self.send(Intent::SetTestParams(params)).await
    }

    pub async fn start_run(&self) -> Result<(), OrchestratorError> {
        self.send(Intent::StartRun).await
    }

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.send(Intent::Stop).await
    }

    pub async fn toggle_watch(&self, on: bool) -> Result<(), OrchestratorError> {
        self.send(Intent::ToggleWatch(on)).await
    }

    pub async fn refresh_packages(&self) -> Result<(), OrchestratorError> {
        self.send(Intent::RefreshPackageList).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Current state snapshot
    pub fn state(&self) -> State {
        self.store.get()
    }

    /// Resolves once the loop has ended, whether by shutdown or a fatal error
    pub async fn closed(&self) {
        self.intents.closed().await
    }

    /// Stop the loop and wait for it to release its process and watcher
    pub async fn shutdown(self) -> Result<(), OrchestratorError> {
        // A closed queue means the loop already ended; its result is in the task
        let _ = self.intents.send(Intent::Shutdown).await;
        self.task.await?
    }
}
