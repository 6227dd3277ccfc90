//! Shared types, errors, stage template, and ledger entry model for the Corvus
//! pipeline engine.
//!
//! This crate provides the foundational types used across all other Corvus crates:
//! - `CorvusError`: unified error taxonomy
//! - `StageState`: the closed stage lifecycle and its transition table
//! - `StageDefinition`: static stage template entries
//! - `LedgerEntry` / `EntryDraft`: the sealed and unsealed units of durable fact
//! - `VersionPin`: toolchain and ruleset pins recorded on every entry

pub mod entry;
pub mod hashing;
pub mod timestamp_serde;
pub mod version;

pub use entry::{EntryDraft, LedgerEntry, TrustContext, TRUST_CONTEXT_VERSION};
pub use hashing::{
    canonical_bytes_of, canonical_json_bytes, compute_input_hash, compute_output_hash,
    content_address, sha256_hex,
};
pub use version::VersionPin;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unified error type for all Corvus subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CorvusError {
    // === State machine ===
    #[error("Cannot transition {stage_id} from {from} to {to}. Allowed: [{}]", join_states(.allowed))]
    InvalidTransition {
        stage_id: String,
        from: StageState,
        to: StageState,
        allowed: Vec<StageState>,
    },

    #[error("Cannot start {stage_id}: prerequisites not met. Blocked by: {}", .reasons.join("; "))]
    PrerequisiteNotMet {
        stage_id: String,
        reasons: Vec<String>,
    },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Run {0} already has ledger entries; resume it instead of initializing")]
    RunAlreadyInitialized(String),

    // === Graph construction ===
    #[error("Prerequisite graph has a cycle. Visited {reachable}/{total} stages")]
    CyclicDependency { reachable: usize, total: usize },

    #[error("Invalid stage table: {0}")]
    InvalidStageTable(String),

    // === Ledger ===
    #[error("Ledger integrity violation: {0}")]
    LedgerIntegrity(#[from] IntegrityViolation),

    #[error("Ledger storage error: {0}")]
    Storage(String),

    #[error("Version drift detected: {}", .0.join("; "))]
    VersionDrift(Vec<String>),

    // === Execution ===
    #[error("Stage '{stage_id}' execution failed: {message}")]
    StageExecution { stage_id: String, message: String },

    // === Generic ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CorvusError {
    /// Returns `true` for tamper or corruption failures detected by verification.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CorvusError::LedgerIntegrity(_))
    }

    /// Returns `true` when the caller asked for something the state machine
    /// refuses. These are never retried automatically.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CorvusError::InvalidTransition { .. }
                | CorvusError::PrerequisiteNotMet { .. }
                | CorvusError::UnknownStage(_)
                | CorvusError::RunAlreadyInitialized(_)
        )
    }
}

/// Distinguishable ways a ledger chain or anchor comparison can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("chain broken at entry {entry_id}: expected previous_hash={expected:?}, got {actual:?}")]
    BrokenLink {
        entry_id: String,
        expected: String,
        actual: String,
    },

    #[error("tampered entry {entry_id}: expected hash={expected:?}, got {actual:?}")]
    HashMismatch {
        entry_id: String,
        expected: String,
        actual: String,
    },

    #[error("corrupt entry {entry_id}: column {column}: {detail}")]
    CorruptEntry {
        entry_id: String,
        column: String,
        detail: String,
    },

    #[error("run {run_id} has {actual} entries but anchor expects at least {expected}")]
    EntryCountMismatch {
        run_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("first entry hash mismatch: chain has {actual:?}, anchor has {expected:?}")]
    FirstEntryMismatch { expected: String, actual: String },

    #[error("root hash mismatch at entry {position}: chain has {actual:?}, anchor has {expected:?}")]
    RootHashMismatch {
        position: usize,
        expected: String,
        actual: String,
    },

    #[error("anchor for run {run_id} does not match its own digest")]
    AnchorDigestMismatch { run_id: String },
}

/// A convenience alias for `Result<T, CorvusError>`.
pub type Result<T> = std::result::Result<T, CorvusError>;

fn join_states(states: &[StageState]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// StageState: the closed lifecycle of a pipeline stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    Running,
    Blocked,
    Failed,
    Passed,
    Waived,
}

impl StageState {
    pub const ALL: [StageState; 6] = [
        StageState::NotStarted,
        StageState::Running,
        StageState::Blocked,
        StageState::Failed,
        StageState::Passed,
        StageState::Waived,
    ];

    /// Outgoing edges of the transition table. Adding a state forces a new arm here.
    pub fn allowed_targets(self) -> &'static [StageState] {
        match self {
            StageState::NotStarted => &[StageState::Running, StageState::Blocked],
            StageState::Running => &[StageState::Passed, StageState::Failed, StageState::Blocked],
            StageState::Blocked => &[StageState::NotStarted, StageState::Waived],
            StageState::Failed => &[StageState::NotStarted],
            StageState::Passed | StageState::Waived => &[],
        }
    }

    pub fn can_transition_to(self, target: StageState) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Whether a prerequisite in this state lets its dependents run.
    pub fn satisfies_prerequisite(self) -> bool {
        matches!(self, StageState::Passed | StageState::Waived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::NotStarted => "not_started",
            StageState::Running => "running",
            StageState::Blocked => "blocked",
            StageState::Failed => "failed",
            StageState::Passed => "passed",
            StageState::Waived => "waived",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StageState::ALL
            .into_iter()
            .find(|state| state.as_str() == s.trim())
            .ok_or_else(|| format!("unknown stage state: {s:?}"))
    }
}

/// Current state of every stage in one run, keyed by stage id.
pub type StateTable = BTreeMap<String, StageState>;

// ---------------------------------------------------------------------------
// StateTransition: the "<from>-><to>" string recorded in the ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: StageState,
    pub to: StageState,
}

impl StateTransition {
    pub fn new(from: StageState, to: StageState) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

impl FromStr for StateTransition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (from, to) = s
            .split_once("->")
            .ok_or_else(|| format!("transition {s:?} is missing '->'"))?;
        Ok(Self {
            from: from.parse()?,
            to: to.parse()?,
        })
    }
}

// ---------------------------------------------------------------------------
// StageDefinition: static pipeline template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage_id: String,
    pub display_name: String,
    /// Position in the pipeline: 0, 1, ..., 5.5, 5.75, 6, 7.
    pub ordinal: f64,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Mandatory gates are never bypassed without an explicit waiver.
    #[serde(default)]
    pub is_mandatory_gate: bool,
}

impl StageDefinition {
    pub fn new(stage_id: impl Into<String>, display_name: impl Into<String>, ordinal: f64) -> Self {
        Self {
            stage_id: stage_id.into(),
            display_name: display_name.into(),
            ordinal,
            prerequisites: Vec::new(),
            is_mandatory_gate: false,
        }
    }

    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    pub fn mandatory_gate(mut self) -> Self {
        self.is_mandatory_gate = true;
        self
    }
}

/// The standard ten-stage build and compliance pipeline.
pub fn default_stage_definitions() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("s0_intake", "Intake", 0.0),
        StageDefinition::new("s1_prerequisites", "Prerequisites Synthesis", 1.0).after(["s0_intake"]),
        StageDefinition::new("s2_environment", "Environment Readiness", 2.0)
            .after(["s1_prerequisites"]),
        StageDefinition::new("s3_test_contract", "Test Contracting", 3.0).after(["s2_environment"]),
        StageDefinition::new("s4_code_plan", "Code Plan", 4.0).after(["s3_test_contract"]),
        StageDefinition::new("s5_implementation", "Implementation", 5.0).after(["s4_code_plan"]),
        StageDefinition::new("s55_accessibility", "Accessibility Gate", 5.5)
            .after(["s5_implementation"])
            .mandatory_gate(),
        StageDefinition::new("s575_security", "Security & Red Team Gate", 5.75)
            .after(["s5_implementation"])
            .mandatory_gate(),
        StageDefinition::new("s6_verification", "Verification", 6.0)
            .after(["s55_accessibility", "s575_security"]),
        StageDefinition::new("s7_release", "Release & Attestation", 7.0).after(["s6_verification"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for state in StageState::ALL {
            let terminal = matches!(state, StageState::Passed | StageState::Waived);
            assert_eq!(state.is_terminal(), terminal, "{state}");
        }
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use StageState::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(NotStarted.can_transition_to(Blocked));
        assert!(!NotStarted.can_transition_to(Passed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Waived));
        assert!(!Blocked.can_transition_to(Running));
        assert_eq!(Failed.allowed_targets(), &[NotStarted]);
        assert!(!Passed.can_transition_to(NotStarted));
    }

    #[test]
    fn state_string_round_trip() {
        for state in StageState::ALL {
            assert_eq!(state.as_str().parse::<StageState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("finished".parse::<StageState>().is_err());
    }

    #[test]
    fn transition_parses_arrow_form() {
        let t: StateTransition = "not_started->running".parse().unwrap();
        assert_eq!(t, StateTransition::new(StageState::NotStarted, StageState::Running));
        assert_eq!(t.to_string(), "not_started->running");
        assert!("envelope_received".parse::<StateTransition>().is_err());
        assert!("running->done".parse::<StateTransition>().is_err());
    }

    #[test]
    fn default_template_has_two_mandatory_gates() {
        let defs = default_stage_definitions();
        assert_eq!(defs.len(), 10);
        let gates: Vec<_> = defs
            .iter()
            .filter(|d| d.is_mandatory_gate)
            .map(|d| d.stage_id.as_str())
            .collect();
        assert_eq!(gates, vec!["s55_accessibility", "s575_security"]);
        let verification = defs.iter().find(|d| d.stage_id == "s6_verification").unwrap();
        assert_eq!(verification.prerequisites, vec!["s55_accessibility", "s575_security"]);
    }

    #[test]
    fn error_display_invalid_transition() {
        let err = CorvusError::InvalidTransition {
            stage_id: "s1_prerequisites".into(),
            from: StageState::Passed,
            to: StageState::Running,
            allowed: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Cannot transition s1_prerequisites from passed to running. Allowed: []"
        );
        assert!(err.is_caller_error());
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn error_display_prerequisite_not_met() {
        let err = CorvusError::PrerequisiteNotMet {
            stage_id: "s2_environment".into(),
            reasons: vec![
                "Prerequisites Synthesis (s1_prerequisites) is running".into(),
                "Intake (s0_intake) is failed".into(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Cannot start s2_environment: prerequisites not met. Blocked by: \
             Prerequisites Synthesis (s1_prerequisites) is running; Intake (s0_intake) is failed"
        );
    }

    #[test]
    fn error_display_cycle() {
        let err = CorvusError::CyclicDependency { reachable: 0, total: 2 };
        assert_eq!(err.to_string(), "Prerequisite graph has a cycle. Visited 0/2 stages");
    }

    #[test]
    fn integrity_error_wraps_violation() {
        let err: CorvusError = IntegrityViolation::HashMismatch {
            entry_id: "e1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into();
        assert!(err.is_integrity_failure());
        assert!(err.to_string().contains("tampered entry e1"));
    }
}
