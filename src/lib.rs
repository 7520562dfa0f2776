//! gogreen - Go test runner
//!
//! A library for running `go test` from a long-lived host with:
//! - Single-flight runs: at most one test process at a time
//! - Watch mode with debounced restarts on source changes
//! - Two-phase cancellation (interrupt, then kill after a grace period)
//! - Package and test function discovery via `go test -list`
//! - A broadcast event stream for any number of observers

pub mod config;
pub mod discovery;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod state;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use events::{Event, EventBus};
pub use executor::{GoTestExecutor, OutputLine, RunResult, Stream};
pub use orchestrator::{Intent, Orchestrator, OrchestratorError, OrchestratorHandle};
pub use state::{Package, State, TestParams};
