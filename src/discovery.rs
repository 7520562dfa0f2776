//! Package discovery
//!
//! Lists packages and their test functions by parsing the JSON event stream of
//! `go test -list=^Test -json <pattern>`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

use crate::state::{Package, ALL_PACKAGES, CURRENT_PACKAGE};

/// Only `Test*` functions; examples, benchmarks and fuzz targets are skipped
const LIST_PATTERN: &str = "^Test";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("{0} is not a directory")]
    InvalidDirectory(PathBuf),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("package listing failed ({status}): {stderr}")]
    Command { status: String, stderr: String },
    #[error("unexpected package listing output on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Supplies the packages below a working directory
pub trait Discovery: Send + Sync {
    fn list_packages(&self, cwd: &Path) -> Result<Vec<Package>, DiscoveryError>;
}

/// Entries offered for package selection: the two patterns, then every package
pub fn package_choices(packages: &[Package]) -> Vec<String> {
    let mut choices = vec![CURRENT_PACKAGE.to_string(), ALL_PACKAGES.to_string()];
    choices.extend(packages.iter().map(|p| p.pkg.clone()));
    choices
}

/// Discovery through the go toolchain
pub struct GoDiscovery {
    go: PathBuf,
}

impl GoDiscovery {
    pub fn new(go: impl Into<PathBuf>) -> Self {
        Self { go: go.into() }
    }

    /// Packages matching `pattern`, with their test functions
    pub fn list_test_funcs(&self, cwd: &Path, pattern: &str) -> Result<Vec<Package>, DiscoveryError> {
        if !cwd.is_dir() {
            return Err(DiscoveryError::InvalidDirectory(cwd.to_path_buf()));
        }

        let output = Command::new(&self.go)
            .args(["test", &format!("-list={}", LIST_PATTERN), "-json", pattern])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| DiscoveryError::Spawn {
                program: self.go.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiscoveryError::Command {
                status: output.status.to_string(),
                stderr: excerpt(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        let packages = parse_test_list(&String::from_utf8_lossy(&output.stdout))?;
        debug!(cwd = %cwd.display(), pattern, count = packages.len(), "listed packages");

        Ok(packages)
    }
}

impl Discovery for GoDiscovery {
    fn list_packages(&self, cwd: &Path) -> Result<Vec<Package>, DiscoveryError> {
        self.list_test_funcs(cwd, ALL_PACKAGES)
    }
}

/// One line of `go test -json`
#[derive(Debug, Deserialize)]
struct TestEvent {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Package", default)]
    package: String,
    #[serde(rename = "Output", default)]
    output: String,
}

/// Parse `go test -list -json` output.
///
/// Output format (one JSON object per line):
/// ```text
/// {"Action":"output","Package":"example.com/app/store","Output":"TestGet\n"}
/// {"Action":"output","Package":"example.com/app/store","Output":"ok  \texample.com/app/store\t0.002s\n"}
/// {"Action":"pass","Package":"example.com/app/store","Elapsed":0.002}
/// ```
fn parse_test_list(output: &str) -> Result<Vec<Package>, DiscoveryError> {
    let mut packages: Vec<Package> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (n, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: TestEvent =
            serde_json::from_str(line).map_err(|source| DiscoveryError::Parse { line: n + 1, source })?;

        if event.package.is_empty() {
            continue;
        }

        let slot = *index.entry(event.package.clone()).or_insert_with(|| {
            packages.push(Package::new(event.package.clone()));
            packages.len() - 1
        });

        if event.action == "output" && event.output.starts_with("Test") {
            packages[slot].test_funcs.push(event.output.trim().to_string());
        }
    }

    Ok(packages)
}

fn excerpt(stderr: &str) -> String {
    const MAX_LINES: usize = 20;
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}
