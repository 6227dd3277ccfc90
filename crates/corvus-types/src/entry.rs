//! Ledger entry model.
//!
//! An [`EntryDraft`] holds everything the writer knows about a transition.
//! [`EntryDraft::seal`] links it to the previous entry of its run and attaches
//! the digest, producing an immutable [`LedgerEntry`]. The digest is computed
//! over [`EntryBody`], a view that has no seal field at all.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::{canonical_bytes_of, sha256_hex};
use crate::timestamp_serde;
use crate::version::VersionPin;
use crate::{Result, StateTransition};

/// Key name → fingerprint of the trust keys active when an entry was written.
pub type TrustContext = BTreeMap<String, String>;

pub const TRUST_CONTEXT_VERSION: &str = "1";

fn default_trust_context_version() -> String {
    TRUST_CONTEXT_VERSION.to_string()
}

// ---------------------------------------------------------------------------
// EntryDraft
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub entry_id: String,
    pub run_id: String,
    pub stage_id: String,
    pub state_transition: String,
    pub timestamp_utc: DateTime<Utc>,
    pub input_hash: String,
    pub output_hash: String,
    pub artifact_references: Vec<String>,
    pub versions: VersionPin,
    pub waiver_references: Vec<String>,
    pub payload_hash: String,
    pub trust_context: TrustContext,
    pub trust_context_version: String,
}

impl EntryDraft {
    /// Draft for a stage state transition.
    pub fn new(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        transition: StateTransition,
    ) -> Self {
        Self::event(run_id, stage_id, transition.to_string())
    }

    /// Draft with a free-form transition label, for events that are not
    /// stage lifecycle changes.
    pub fn event(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        state_transition: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            stage_id: stage_id.into(),
            state_transition: state_transition.into(),
            timestamp_utc: timestamp_serde::now(),
            input_hash: String::new(),
            output_hash: String::new(),
            artifact_references: Vec::new(),
            versions: VersionPin::default(),
            waiver_references: Vec::new(),
            payload_hash: String::new(),
            trust_context: TrustContext::new(),
            trust_context_version: default_trust_context_version(),
        }
    }

    pub fn with_versions(mut self, versions: VersionPin) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_hashes(mut self, input_hash: impl Into<String>, output_hash: impl Into<String>) -> Self {
        self.input_hash = input_hash.into();
        self.output_hash = output_hash.into();
        self
    }

    pub fn with_artifacts(mut self, artifact_references: Vec<String>) -> Self {
        self.artifact_references = artifact_references;
        self
    }

    pub fn with_waivers(mut self, waiver_references: Vec<String>) -> Self {
        self.waiver_references = waiver_references;
        self
    }

    pub fn with_trust_context(mut self, trust_context: TrustContext) -> Self {
        self.trust_context = trust_context;
        self
    }

    /// Link the draft to its predecessor and compute the seal.
    pub fn seal(self, previous_entry_hash: impl Into<String>) -> Result<LedgerEntry> {
        let VersionPin {
            pipeline_version,
            schema_version,
            toolchain_version,
            ruleset_versions,
        } = self.versions;

        let mut entry = LedgerEntry {
            entry_id: self.entry_id,
            run_id: self.run_id,
            stage_id: self.stage_id,
            state_transition: self.state_transition,
            timestamp_utc: self.timestamp_utc,
            input_hash: self.input_hash,
            output_hash: self.output_hash,
            artifact_references: self.artifact_references,
            pipeline_version,
            schema_version,
            toolchain_version,
            ruleset_versions,
            waiver_references: self.waiver_references,
            payload_hash: self.payload_hash,
            trust_context: self.trust_context,
            trust_context_version: self.trust_context_version,
            previous_entry_hash: previous_entry_hash.into(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// A sealed, persisted ledger record. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub run_id: String,
    pub stage_id: String,
    pub state_transition: String,
    #[serde(with = "timestamp_serde")]
    pub timestamp_utc: DateTime<Utc>,
    #[serde(default)]
    pub input_hash: String,
    #[serde(default)]
    pub output_hash: String,
    #[serde(default)]
    pub artifact_references: Vec<String>,
    pub pipeline_version: String,
    pub schema_version: String,
    pub toolchain_version: String,
    #[serde(default)]
    pub ruleset_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub waiver_references: Vec<String>,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default)]
    pub trust_context: TrustContext,
    #[serde(default = "default_trust_context_version")]
    pub trust_context_version: String,
    #[serde(default)]
    pub previous_entry_hash: String,
    pub entry_hash: String,
}

/// Every field of an entry except the seal.
#[derive(Serialize)]
struct EntryBody<'a> {
    entry_id: &'a str,
    run_id: &'a str,
    stage_id: &'a str,
    state_transition: &'a str,
    timestamp_utc: String,
    input_hash: &'a str,
    output_hash: &'a str,
    artifact_references: &'a [String],
    pipeline_version: &'a str,
    schema_version: &'a str,
    toolchain_version: &'a str,
    ruleset_versions: &'a BTreeMap<String, String>,
    waiver_references: &'a [String],
    payload_hash: &'a str,
    trust_context: &'a TrustContext,
    trust_context_version: &'a str,
    previous_entry_hash: &'a str,
}

impl LedgerEntry {
    fn body(&self) -> EntryBody<'_> {
        EntryBody {
            entry_id: &self.entry_id,
            run_id: &self.run_id,
            stage_id: &self.stage_id,
            state_transition: &self.state_transition,
            timestamp_utc: timestamp_serde::format(&self.timestamp_utc),
            input_hash: &self.input_hash,
            output_hash: &self.output_hash,
            artifact_references: &self.artifact_references,
            pipeline_version: &self.pipeline_version,
            schema_version: &self.schema_version,
            toolchain_version: &self.toolchain_version,
            ruleset_versions: &self.ruleset_versions,
            waiver_references: &self.waiver_references,
            payload_hash: &self.payload_hash,
            trust_context: &self.trust_context,
            trust_context_version: &self.trust_context_version,
            previous_entry_hash: &self.previous_entry_hash,
        }
    }

    /// SHA-256 of the canonical serialization of everything but `entry_hash`.
    pub fn compute_hash(&self) -> Result<String> {
        Ok(sha256_hex(&canonical_bytes_of(&self.body())?))
    }

    /// Whether the stored seal still matches the entry's content.
    pub fn is_seal_intact(&self) -> Result<bool> {
        Ok(self.compute_hash()? == self.entry_hash)
    }

    /// The parsed lifecycle transition, or `None` for free-form event labels.
    pub fn transition(&self) -> Option<StateTransition> {
        self.state_transition.parse().ok()
    }

    pub fn versions(&self) -> VersionPin {
        VersionPin {
            pipeline_version: self.pipeline_version.clone(),
            schema_version: self.schema_version.clone(),
            toolchain_version: self.toolchain_version.clone(),
            ruleset_versions: self.ruleset_versions.clone(),
        }
    }
}
