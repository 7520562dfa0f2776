use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::{TestParams, ALL_PACKAGES};

pub const CONFIG_FILE: &str = "gogreen.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchSettings,
    pub run: RunSettings,
    pub events: EventSettings,
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Quiet period after the last file event before a change is signalled
    pub debounce_ms: u64,
    /// Start a run as soon as watch mode is entered
    pub run_on_start: bool,
    /// Files that count as source changes
    pub include: Vec<String>,
    /// Files never counted, even when included (build and profiling artifacts)
    pub ignore: Vec<String>,
    /// Directory names skipped anywhere in the tree
    pub exclude_dirs: Vec<String>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            run_on_start: true,
            include: ["*.go", "go.mod", "go.sum", "go.work"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore: ["*.test", "*.out", "*.prof", "*~", ".#*"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_dirs: [
                ".git", ".hg", ".svn", "node_modules", "vendor", "bin", "dist", "build", "out",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl WatchSettings {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Go toolchain binary
    pub go: PathBuf,
    /// Pass `-json` to `go test`
    pub json: bool,
    /// Pass `-count=1` so results are never served from the test cache
    pub no_cache: bool,
    /// Time between SIGINT and SIGKILL when a run is cancelled
    pub grace_period_ms: u64,
    /// Lines buffered between the test process and the orchestrator
    pub output_buffer: usize,
    /// Lines kept in each run result
    pub retained_lines: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            go: PathBuf::from("go"),
            json: false,
            no_cache: true,
            grace_period_ms: 2000,
            output_buffer: 1024,
            retained_lines: 10_000,
        }
    }
}

impl RunSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Events buffered per subscriber before the oldest are dropped
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Initial test parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub pkg: String,
    pub verbose: bool,
    pub race: bool,
    pub run: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            pkg: ALL_PACKAGES.to_string(),
            verbose: true,
            race: false,
            run: String::new(),
        }
    }
}

impl Defaults {
    pub fn test_params(&self) -> TestParams {
        TestParams {
            pkg: self.pkg.clone(),
            verbose: self.verbose,
            race: self.race,
            run: Some(self.run.clone()),
        }
        .normalized()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `explicit` if given, else `gogreen.toml` in `dir` if present, else defaults
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.watch.debounce_ms == 0 {
            anyhow::bail!("watch.debounce_ms must be greater than 0");
        }
        if self.run.grace_period_ms == 0 {
            anyhow::bail!("run.grace_period_ms must be greater than 0");
        }
        if self.run.output_buffer == 0 {
            anyhow::bail!("run.output_buffer must be greater than 0");
        }
        if self.events.capacity == 0 {
            anyhow::bail!("events.capacity must be greater than 0");
        }

        for pattern in self.watch.include.iter().chain(&self.watch.ignore) {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid watch pattern '{}'", pattern))?;
        }

        self.defaults
            .test_params()
            .validate()
            .with_context(|| format!("Invalid defaults.run pattern '{}'", self.defaults.run))?;

        Ok(())
    }
}
