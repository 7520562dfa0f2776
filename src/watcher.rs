//! File watcher for automatic test re-running
//!
//! Watches the working directory tree and emits one [`ChangeSignal`] per burst
//! of relevant file events, once the tree has been quiet for the debounce
//! period.

use glob::Pattern;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchSettings;

/// One debounced change in the watched tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSignal {
    /// Changed paths relative to the watch root, first-seen order
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("cannot watch {0}: not an existing directory")]
    MissingRoot(PathBuf),
    #[error("invalid watch pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("cannot watch {path}: {source}")]
    Backend {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// An active watch. Releasing it stops further signals.
pub trait Subscription: Send {
    /// Idempotent
    fn unsubscribe(&mut self);
}

/// Something that can watch a directory tree for changes
pub trait WatchBackend: Send + Sync {
    fn subscribe(
        &self,
        root: &Path,
        signals: mpsc::Sender<ChangeSignal>,
    ) -> Result<Box<dyn Subscription>, WatchError>;
}

/// Decides which paths count as source changes
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    include: Vec<Pattern>,
    ignore: Vec<Pattern>,
    exclude_dirs: Vec<String>,
}

impl PathFilter {
    pub fn new(root: &Path, settings: &WatchSettings) -> Result<Self, WatchError> {
        Ok(Self {
            root: root.to_path_buf(),
            include: compile(&settings.include)?,
            ignore: compile(&settings.ignore)?,
            exclude_dirs: settings.exclude_dirs.clone(),
        })
    }

    /// Path relative to the root, if it is a relevant source file
    pub fn relevant(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);

        let excluded = rel.components().any(|c| match c {
            Component::Normal(name) => self
                .exclude_dirs
                .iter()
                .any(|dir| name.to_str() == Some(dir.as_str())),
            _ => false,
        });
        if excluded {
            return None;
        }

        let file_name = rel.file_name()?.to_string_lossy();
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let matches = |p: &Pattern| {
            if p.as_str().contains('/') {
                p.matches(&rel_str)
            } else {
                p.matches(&file_name)
            }
        };

        if !self.include.iter().any(matches) || self.ignore.iter().any(matches) {
            return None;
        }

        Some(rel.to_path_buf())
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, WatchError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| WatchError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Filesystem watcher backed by `notify`
pub struct FsWatcher {
    settings: WatchSettings,
}

impl FsWatcher {
    pub fn new(settings: WatchSettings) -> Self {
        Self { settings }
    }
}

impl WatchBackend for FsWatcher {
    fn subscribe(
        &self,
        root: &Path,
        signals: mpsc::Sender<ChangeSignal>,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }

        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let filter = PathFilter::new(&root, &self.settings)?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let backend_err = |source| WatchError::Backend {
            path: root.clone(),
            source,
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths.iter().filter_map(|p| filter.relevant(p)) {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )
        .map_err(backend_err)?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(backend_err)?;

        info!(root = %root.display(), "watching for changes");

        let task = tokio::spawn(debounce(raw_rx, self.settings.quiet_period(), signals));

        Ok(Box::new(WatchHandle {
            root,
            watcher: Some(watcher),
            task: Some(task),
        }))
    }
}

/// Live `notify` subscription plus its debounce task
pub struct WatchHandle {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl Subscription for WatchHandle {
    fn unsubscribe(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            drop(watcher);
            info!(root = %self.root.display(), "stopped watching");
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Coalesce raw events into one signal per burst.
///
/// Each event pushes the deadline out to `quiet` from now; the signal fires once
/// the deadline passes with no further events. A signal that cannot be queued
/// because one is already pending is dropped, along with its paths; the pending
/// signal already means "changed".
pub async fn debounce(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    quiet: Duration,
    out: mpsc::Sender<ChangeSignal>,
) {
    while let Some(first) = raw.recv().await {
        let mut signal = ChangeSignal { paths: vec![first] };

        let timer = tokio::time::sleep(quiet);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                next = raw.recv() => match next {
                    Some(path) => {
                        if !signal.paths.contains(&path) {
                            signal.paths.push(path);
                        }
                        timer.as_mut().reset(Instant::now() + quiet);
                    }
                    None => return,
                },
                () = &mut timer => break,
            }
        }

        debug!(paths = signal.paths.len(), "change detected");

        match out.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("change already pending, burst dropped"),
            Err(TrySendError::Closed(_)) => return,
        }
    }
}
