//! Outbound event stream
//!
//! Observers subscribe to a broadcast channel. Each subscriber has its own
//! bounded buffer; a subscriber that falls behind loses its oldest events and
//! sees `RecvError::Lagged` instead of slowing the orchestrator down.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::executor::{OutputLine, RunResult};
use crate::state::{Package, State, TestParams};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    StateChanged(State),
    RunStarted { run_id: Uuid, params: TestParams },
    OutputLine(OutputLine),
    RunFinished(RunResult),
    PackagesListed(Vec<Package>),
    WatchError { message: String },
    DiscoveryError { message: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Never blocks; events published with no subscribers are dropped.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
