//! Orchestrator state model
//!
//! The authoritative [`State`] lives in a [`StateStore`]. Everything outside the
//! orchestrator only ever sees cloned snapshots.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Package pattern that selects every package below the working directory.
pub const ALL_PACKAGES: &str = "./...";

/// Package pattern for the package in the working directory itself.
pub const CURRENT_PACKAGE: &str = ".";

/// Parameters for one `go test` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestParams {
    /// Package path or pattern (e.g. `./...`, `./internal/store`)
    pub pkg: String,
    /// Pass `-v`
    #[serde(default)]
    pub verbose: bool,
    /// Pass `-race`
    #[serde(default)]
    pub race: bool,
    /// Test name filter passed to `-run`
    #[serde(default)]
    pub run: Option<String>,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            pkg: ALL_PACKAGES.to_string(),
            verbose: true,
            race: false,
            run: None,
        }
    }
}

impl TestParams {
    pub fn for_package(pkg: impl Into<String>) -> Self {
        Self {
            pkg: pkg.into(),
            ..Self::default()
        }
    }

    /// Blank filters mean "no filter".
    pub fn normalized(mut self) -> Self {
        if self.run.as_deref().is_some_and(|r| r.trim().is_empty()) {
            self.run = None;
        }
        if self.pkg.trim().is_empty() {
            self.pkg = ALL_PACKAGES.to_string();
        }
        self
    }

    /// Validate the `-run` filter as a regular expression
    pub fn validate(&self) -> Result<(), regex::Error> {
        if let Some(ref pattern) = self.run {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }
}

/// A package and the test functions discovered in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub pkg: String,
    #[serde(rename = "testFuncs", default)]
    pub test_funcs: Vec<String>,
}

impl Package {
    pub fn new(pkg: impl Into<String>) -> Self {
        Self {
            pkg: pkg.into(),
            test_funcs: Vec::new(),
        }
    }
}

/// State published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub cwd: PathBuf,
    pub pkg_list: Vec<String>,
    pub watching: bool,
    pub running: bool,
    pub test_params: TestParams,
}

impl State {
    pub fn new(cwd: PathBuf, test_params: TestParams) -> Self {
        Self {
            cwd,
            pkg_list: Vec::new(),
            watching: false,
            running: false,
            test_params,
        }
    }
}

/// Mutex-guarded owner of the current [`State`].
///
/// Updates serialize; readers get a consistent snapshot of a completed update.
#[derive(Debug)]
pub struct StateStore {
    inner: Mutex<State>,
}

impl StateStore {
    pub fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Snapshot of the current state
    pub fn get(&self) -> State {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `mutator` and return the resulting snapshot
    pub(crate) fn update<F>(&self, mutator: F) -> State
    where
        F: FnOnce(&mut State),
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        mutator(&mut guard);
        guard.clone()
    }
}
