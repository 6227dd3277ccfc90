//! Run event feed for monitors and projections.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! read-only observers (build monitors, loggers, dashboards) can follow a run
//! without being able to change it. The ledger stays the source of truth; an
//! observer that lags and misses events can always re-read it.

use serde::{Deserialize, Serialize};

use corvus_types::StageState;

/// Events emitted as runs progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunInitialized {
        run_id: String,
        stage_count: usize,
    },
    StageTransitioned {
        run_id: String,
        stage_id: String,
        from: StageState,
        to: StageState,
        entry_hash: String,
    },
    StagesBlocked {
        run_id: String,
        cause: String,
        stage_ids: Vec<String>,
    },
    StagesUnblocked {
        run_id: String,
        cause: String,
        stage_ids: Vec<String>,
    },
    ChainVerified {
        run_id: String,
        entry_count: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
