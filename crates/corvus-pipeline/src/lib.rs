//! Corvus pipeline core: prerequisite graph, stage state machine, and the
//! orchestrator that runs stage logic through them.
//!
//! Every accepted transition is written to a [`corvus_ledger::RunLedger`]
//! before the in-memory state changes, so a run's state can always be rebuilt
//! from its ledger alone.

pub mod config;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod stage_machine;

pub use config::CorvusConfig;
pub use events::{EventEmitter, PipelineEvent};
pub use graph::{apply_changes, PrerequisiteGraph, StageChange};
pub use orchestrator::{Orchestrator, StageHandler, StageOutput};
pub use stage_machine::{replay_entries, StageMachine, TransitionInputs};
