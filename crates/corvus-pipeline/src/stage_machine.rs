//! Stage lifecycle authority.
//!
//! [`StageMachine`] is the only writer of stage-level ledger entries. It keeps
//! one state table per run as a cache over the ledger: a missing table is
//! rebuilt by replaying the run's entries, so a restarted process resumes
//! exactly where the ledger says it left off.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError};

use corvus_ledger::RunLedger;
use corvus_types::{
    CorvusError, EntryDraft, LedgerEntry, Result, StageState, StateTable, StateTransition,
    TrustContext, VersionPin,
};
use tokio::sync::Mutex;

use crate::events::{EventEmitter, PipelineEvent};
use crate::graph::{PrerequisiteGraph, StageChange};

/// Caller-supplied facts recorded with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionInputs {
    pub input_hash: String,
    pub output_hash: String,
    pub artifact_references: Vec<String>,
    pub waiver_references: Vec<String>,
    pub trust_context: TrustContext,
}

type RunSlot = Arc<Mutex<Option<StateTable>>>;

pub struct StageMachine {
    ledger: Arc<RunLedger>,
    graph: Arc<PrerequisiteGraph>,
    versions: VersionPin,
    strict_version_pins: bool,
    events: Option<EventEmitter>,
    /// run_id -> cached state table. Each slot's mutex serializes all work on that run.
    runs: std::sync::Mutex<HashMap<String, RunSlot>>,
}

impl StageMachine {
    pub fn new(ledger: Arc<RunLedger>, graph: Arc<PrerequisiteGraph>) -> Self {
        Self {
            ledger,
            graph,
            versions: VersionPin::default(),
            strict_version_pins: true,
            events: None,
            runs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_versions(mut self, versions: VersionPin) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_strict_version_pins(mut self, strict: bool) -> Self {
        self.strict_version_pins = strict;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn graph(&self) -> &Arc<PrerequisiteGraph> {
        &self.graph
    }

    pub fn versions(&self) -> &VersionPin {
        &self.versions
    }

    // -----------------------------------------------------------------------
    // Run state
    // -----------------------------------------------------------------------

    /// Start a fresh run with every stage `not_started`.
    ///
    /// Fails if the ledger already holds entries for `run_id`; such a run is
    /// resumed by reading its state, never re-initialized.
    pub async fn initialize_run(&self, run_id: &str) -> Result<StateTable> {
        let slot = self.slot(run_id);
        let mut cached = slot.lock().await;

        if self.ledger.entry_count(run_id).await? > 0 {
            return Err(CorvusError::RunAlreadyInitialized(run_id.to_string()));
        }

        let states = self.graph.initial_states();
        *cached = Some(states.clone());

        tracing::info!(run_id = %run_id, stages = states.len(), "Run initialized");
        self.emit(PipelineEvent::RunInitialized {
            run_id: run_id.to_string(),
            stage_count: states.len(),
        });
        Ok(states)
    }

    pub async fn get_current_state(&self, run_id: &str, stage_id: &str) -> Result<StageState> {
        self.require_stage(stage_id)?;
        self.read_run(run_id, |states| current(states, stage_id)).await
    }

    /// Snapshot of every stage's state in a run.
    pub async fn get_all_states(&self, run_id: &str) -> Result<StateTable> {
        self.read_run(run_id, StateTable::clone).await
    }

    /// Forget the cached table of `run_id`. The next access replays the ledger.
    pub async fn evict_run(&self, run_id: &str) {
        let slot = self.slot(run_id);
        slot.lock().await.take();
        self.release(run_id, slot);
    }

    /// Number of runs currently holding a slot.
    pub fn cached_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop the cached table and replay the run from the ledger.
    pub async fn rebuild_run(&self, run_id: &str) -> Result<StateTable> {
        let slot = self.slot(run_id);
        let mut cached = slot.lock().await;
        *cached = None;
        Ok(self.loaded(run_id, &mut *cached).await?.clone())
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move `stage_id` to `target`, record it, and record any cascade.
    ///
    /// Illegal targets and unmet prerequisites are rejected before anything
    /// is written. The cache is updated only after each entry is durable, and
    /// cascade entries are appended only after the primary entry.
    pub async fn transition(
        &self,
        run_id: &str,
        stage_id: &str,
        target: StageState,
        inputs: TransitionInputs,
    ) -> Result<LedgerEntry> {
        self.require_stage(stage_id)?;
        let slot = self.slot(run_id);
        let mut cached = slot.lock().await;
        let states = self.loaded(run_id, &mut *cached).await?;

        let from = current(states, stage_id);
        if !from.can_transition_to(target) {
            tracing::warn!(run_id = %run_id, stage_id = %stage_id, %from, to = %target, "Rejected invalid transition");
            return Err(CorvusError::InvalidTransition {
                stage_id: stage_id.to_string(),
                from,
                to: target,
                allowed: from.allowed_targets().to_vec(),
            });
        }

        if target == StageState::Running && !self.graph.are_prerequisites_met(stage_id, states) {
            let reasons = self.graph.get_blocking_reasons(stage_id, states);
            tracing::warn!(run_id = %run_id, stage_id = %stage_id, ?reasons, "Rejected start with unmet prerequisites");
            return Err(CorvusError::PrerequisiteNotMet {
                stage_id: stage_id.to_string(),
                reasons,
            });
        }

        let TransitionInputs {
            input_hash,
            output_hash,
            artifact_references,
            waiver_references,
            trust_context,
        } = inputs;

        let draft = EntryDraft::new(run_id, stage_id, StateTransition::new(from, target))
            .with_versions(self.versions.clone())
            .with_hashes(input_hash, output_hash)
            .with_artifacts(artifact_references)
            .with_waivers(waiver_references)
            .with_trust_context(trust_context.clone());
        let entry = self.ledger.append(draft).await?;
        states.insert(stage_id.to_string(), target);

        tracing::info!(run_id = %run_id, stage_id = %stage_id, %from, to = %target, "Stage transitioned");
        self.emit(PipelineEvent::StageTransitioned {
            run_id: run_id.to_string(),
            stage_id: stage_id.to_string(),
            from,
            to: target,
            entry_hash: entry.entry_hash.clone(),
        });

        match target {
            StageState::Failed => {
                let changes = self.graph.cascade_block(stage_id, states);
                self.record_cascade(run_id, &changes, &trust_context, states).await?;
                if !changes.is_empty() {
                    tracing::info!(run_id = %run_id, cause = %stage_id, blocked = changes.len(), "Cascade blocked dependents");
                    self.emit(PipelineEvent::StagesBlocked {
                        run_id: run_id.to_string(),
                        cause: stage_id.to_string(),
                        stage_ids: change_ids(&changes),
                    });
                }
            }
            StageState::Passed => {
                let changes = self.graph.cascade_unblock(stage_id, states);
                self.record_cascade(run_id, &changes, &trust_context, states).await?;
                if !changes.is_empty() {
                    tracing::info!(run_id = %run_id, cause = %stage_id, unblocked = changes.len(), "Cascade unblocked dependents");
                    self.emit(PipelineEvent::StagesUnblocked {
                        run_id: run_id.to_string(),
                        cause: stage_id.to_string(),
                        stage_ids: change_ids(&changes),
                    });
                }
            }
            StageState::NotStarted | StageState::Running | StageState::Blocked | StageState::Waived => {}
        }

        Ok(entry)
    }

    /// Whether `stage_id` may move to `running` now, with the reasons if not.
    pub async fn can_start(&self, run_id: &str, stage_id: &str) -> Result<(bool, Vec<String>)> {
        self.require_stage(stage_id)?;
        self.read_run(run_id, |states| {
            let state = current(states, stage_id);
            if state != StageState::NotStarted {
                return (false, vec![format!("Stage is currently {state}, not not_started")]);
            }
            if !self.graph.are_prerequisites_met(stage_id, states) {
                return (false, self.graph.get_blocking_reasons(stage_id, states));
            }
            (true, Vec::new())
        })
        .await
    }

    pub async fn get_available_transitions(
        &self,
        run_id: &str,
        stage_id: &str,
    ) -> Result<BTreeSet<StageState>> {
        let state = self.get_current_state(run_id, stage_id).await?;
        Ok(state.allowed_targets().iter().copied().collect())
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Compare the pin recorded on the run's latest entry with the current one.
    ///
    /// With strict pins any drift is an error; otherwise it is logged and
    /// returned. A run with no entries has nothing to drift from.
    pub async fn check_version_drift(&self, run_id: &str) -> Result<Vec<String>> {
        let Some(latest) = self.ledger.get_latest(run_id).await? else {
            return Ok(Vec::new());
        };
        let drifts = self.versions.drift_from(&latest.versions());
        if drifts.is_empty() {
            return Ok(drifts);
        }
        if self.strict_version_pins {
            return Err(CorvusError::VersionDrift(drifts));
        }
        tracing::warn!(run_id = %run_id, ?drifts, "Version drift detected");
        Ok(drifts)
    }

    /// Verify the run's chain and announce the result to observers.
    pub async fn verify_chain(&self, run_id: &str) -> Result<bool> {
        let valid = self.ledger.verify_chain(run_id).await?;
        let entry_count = self.ledger.entry_count(run_id).await?;
        self.emit(PipelineEvent::ChainVerified {
            run_id: run_id.to_string(),
            entry_count,
        });
        Ok(valid)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, run_id: &str) -> RunSlot {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(runs.entry(run_id.to_string()).or_default())
    }

    /// Drop the map's slot for `run_id` if it caches nothing and no other
    /// task holds it. Clones are only taken under the map lock held here.
    fn release(&self, run_id: &str, slot: RunSlot) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = Arc::strong_count(&slot) == 2 && slot.try_lock().is_ok_and(|cached| cached.is_none());
        if idle {
            runs.remove(run_id);
        }
    }

    /// Run `f` over the run's states without caching a replay of an empty
    /// ledger, so lookups of unknown runs leave nothing behind.
    async fn read_run<T>(&self, run_id: &str, f: impl FnOnce(&StateTable) -> T) -> Result<T> {
        let slot = self.slot(run_id);
        let out = {
            let mut cached = slot.lock().await;
            match cached.as_ref() {
                Some(states) => Ok(f(states)),
                None => self.ledger.get_run_entries(run_id).await.map(|entries| {
                    let states = replay_entries(&self.graph, &entries);
                    let out = f(&states);
                    if !entries.is_empty() {
                        tracing::debug!(run_id = %run_id, entries = entries.len(), "Rebuilt run state from ledger");
                        *cached = Some(states);
                    }
                    out
                }),
            }
        };
        self.release(run_id, slot);
        out
    }

    fn require_stage(&self, stage_id: &str) -> Result<()> {
        if self.graph.contains(stage_id) {
            Ok(())
        } else {
            Err(CorvusError::UnknownStage(stage_id.to_string()))
        }
    }

    async fn loaded<'a>(
        &self,
        run_id: &str,
        cached: &'a mut Option<StateTable>,
    ) -> Result<&'a mut StateTable> {
        let states = match cached.take() {
            Some(states) => states,
            None => {
                let entries = self.ledger.get_run_entries(run_id).await?;
                let states = replay_entries(&self.graph, &entries);
                tracing::debug!(run_id = %run_id, entries = entries.len(), "Rebuilt run state from ledger");
                states
            }
        };
        Ok(cached.insert(states))
    }

    async fn record_cascade(
        &self,
        run_id: &str,
        changes: &[StageChange],
        trust_context: &TrustContext,
        states: &mut StateTable,
    ) -> Result<()> {
        for change in changes {
            let draft = EntryDraft::new(
                run_id,
                &change.stage_id,
                StateTransition::new(change.from, change.to),
            )
            .with_versions(self.versions.clone())
            .with_trust_context(trust_context.clone());
            self.ledger.append(draft).await?;
            states.insert(change.stage_id.clone(), change.to);
        }
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Fold a run's entries into a state table, starting from all `not_started`.
///
/// Entries that are not stage lifecycle changes of a known stage are skipped.
pub fn replay_entries(graph: &PrerequisiteGraph, entries: &[LedgerEntry]) -> StateTable {
    let mut states = graph.initial_states();
    for entry in entries {
        let Some(transition) = entry.transition() else {
            tracing::warn!(entry_id = %entry.entry_id, transition = %entry.state_transition, "Skipping unparseable ledger entry during replay");
            continue;
        };
        if !graph.contains(&entry.stage_id) {
            tracing::warn!(entry_id = %entry.entry_id, stage_id = %entry.stage_id, "Skipping entry for unknown stage during replay");
            continue;
        }
        states.insert(entry.stage_id.clone(), transition.to);
    }
    states
}

fn current(states: &StateTable, stage_id: &str) -> StageState {
    states.get(stage_id).copied().unwrap_or(StageState::NotStarted)
}

fn change_ids(changes: &[StageChange]) -> Vec<String> {
    changes.iter().map(|c| c.stage_id.clone()).collect()
}
