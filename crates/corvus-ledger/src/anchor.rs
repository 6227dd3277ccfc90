//! External anchoring of a run's chain.
//!
//! An anchor is a small digest of the chain at a point in time. Stored outside
//! the ledger (a file, another database, a transparency log), it exposes
//! rewrites that a fully compromised local store could otherwise hide, such as
//! truncation or a chain regenerated from scratch.

use std::path::Path;

use chrono::{DateTime, Utc};
use corvus_types::{
    canonical_bytes_of, sha256_hex, timestamp_serde, IntegrityViolation, Result,
};
use serde::{Deserialize, Serialize};

use crate::ledger::RunLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    pub run_id: String,
    pub entry_count: usize,
    /// Hash of the last entry at export time.
    pub root_hash: String,
    pub first_entry_hash: String,
    #[serde(with = "timestamp_serde")]
    pub timestamp_utc: DateTime<Utc>,
    pub anchor_hash: String,
}

#[derive(Serialize)]
struct AnchorBody<'a> {
    run_id: &'a str,
    entry_count: usize,
    root_hash: &'a str,
    first_entry_hash: &'a str,
    timestamp_utc: String,
}

impl LedgerAnchor {
    fn new(
        run_id: &str,
        entry_count: usize,
        root_hash: String,
        first_entry_hash: String,
    ) -> Result<Self> {
        let mut anchor = Self {
            run_id: run_id.to_string(),
            entry_count,
            root_hash,
            first_entry_hash,
            timestamp_utc: timestamp_serde::now(),
            anchor_hash: String::new(),
        };
        anchor.anchor_hash = anchor.compute_digest()?;
        Ok(anchor)
    }

    /// SHA-256 over the canonical form of every field except `anchor_hash`.
    pub fn compute_digest(&self) -> Result<String> {
        let body = AnchorBody {
            run_id: &self.run_id,
            entry_count: self.entry_count,
            root_hash: &self.root_hash,
            first_entry_hash: &self.first_entry_hash,
            timestamp_utc: timestamp_serde::format(&self.timestamp_utc),
        };
        Ok(sha256_hex(&canonical_bytes_of(&body)?))
    }

    pub fn is_self_consistent(&self) -> Result<bool> {
        Ok(self.compute_digest()? == self.anchor_hash)
    }

    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl RunLedger {
    /// Capture the current chain state of a run.
    pub async fn export_anchor(&self, run_id: &str) -> Result<LedgerAnchor> {
        let entries = self.get_run_entries(run_id).await?;
        let first = entries.first().map(|e| e.entry_hash.clone()).unwrap_or_default();
        let root = entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default();
        let anchor = LedgerAnchor::new(run_id, entries.len(), root, first)?;
        tracing::info!(
            run_id = %run_id,
            entry_count = anchor.entry_count,
            anchor_hash = %anchor.anchor_hash,
            "Anchor exported"
        );
        Ok(anchor)
    }

    /// Check the current chain against a previously exported anchor.
    ///
    /// The chain may have grown since export; it must still begin with the
    /// anchored first entry, hold the anchored root at the same position, and
    /// verify end to end.
    pub async fn verify_against_anchor(&self, run_id: &str, anchor: &LedgerAnchor) -> Result<bool> {
        if anchor.run_id != run_id || !anchor.is_self_consistent()? {
            return Err(fail(
                run_id,
                IntegrityViolation::AnchorDigestMismatch {
                    run_id: anchor.run_id.clone(),
                },
            ));
        }

        let entries = self.get_run_entries(run_id).await?;
        if entries.len() < anchor.entry_count {
            return Err(fail(
                run_id,
                IntegrityViolation::EntryCountMismatch {
                    run_id: run_id.to_string(),
                    expected: anchor.entry_count,
                    actual: entries.len(),
                },
            ));
        }

        if anchor.entry_count == 0 {
            return Ok(true);
        }

        let first = &entries[0].entry_hash;
        if *first != anchor.first_entry_hash {
            return Err(fail(
                run_id,
                IntegrityViolation::FirstEntryMismatch {
                    expected: anchor.first_entry_hash.clone(),
                    actual: first.clone(),
                },
            ));
        }

        let at_anchor = &entries[anchor.entry_count - 1].entry_hash;
        if *at_anchor != anchor.root_hash {
            return Err(fail(
                run_id,
                IntegrityViolation::RootHashMismatch {
                    position: anchor.entry_count,
                    expected: anchor.root_hash.clone(),
                    actual: at_anchor.clone(),
                },
            ));
        }

        self.verify_chain(run_id).await
    }
}

fn fail(run_id: &str, violation: IntegrityViolation) -> corvus_types::CorvusError {
    tracing::error!(run_id = %run_id, %violation, "Anchor verification failed");
    violation.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_types::{CorvusError, EntryDraft, StageState, StateTransition};

    async fn open_temp() -> (tempfile::TempDir, RunLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::open(dir.path().join("ledger.db")).await.unwrap();
        (dir, ledger)
    }

    async fn append(ledger: &RunLedger, run_id: &str, n: usize) {
        for _ in 0..n {
            ledger
                .append(EntryDraft::new(
                    run_id,
                    "s0_intake",
                    StateTransition::new(StageState::NotStarted, StageState::Running),
                ))
                .await
                .unwrap();
        }
    }

    fn violation(err: CorvusError) -> IntegrityViolation {
        match err {
            CorvusError::LedgerIntegrity(v) => v,
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_run_anchor_verifies() {
        let (_dir, ledger) = open_temp().await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();

        assert_eq!(anchor.entry_count, 0);
        assert_eq!(anchor.root_hash, "");
        assert_eq!(anchor.first_entry_hash, "");
        assert_eq!(anchor.anchor_hash.len(), 64, "empty anchors are still digested");
        assert!(ledger.verify_against_anchor("run-a", &anchor).await.unwrap());
    }

    #[tokio::test]
    async fn anchor_survives_chain_growth() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 3).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();
        assert_eq!(anchor.entry_count, 3);

        append(&ledger, "run-a", 2).await;
        assert!(ledger.verify_against_anchor("run-a", &anchor).await.unwrap());
    }

    #[tokio::test]
    async fn truncation_is_an_entry_count_mismatch() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 3).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();

        let last = ledger.get_latest("run-a").await.unwrap().unwrap();
        sqlx::query("DELETE FROM run_ledger WHERE entry_id = ?")
            .bind(&last.entry_id)
            .execute(ledger.pool())
            .await
            .unwrap();

        let err = ledger.verify_against_anchor("run-a", &anchor).await.unwrap_err();
        assert_eq!(
            violation(err),
            IntegrityViolation::EntryCountMismatch {
                run_id: "run-a".into(),
                expected: 3,
                actual: 2,
            }
        );
    }

    #[tokio::test]
    async fn regenerated_chain_is_a_first_entry_mismatch() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 2).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();

        // Wipe and rebuild a run with the same length: a valid chain, but not the anchored one.
        sqlx::query("DELETE FROM run_ledger WHERE run_id = 'run-a'")
            .execute(ledger.pool())
            .await
            .unwrap();
        append(&ledger, "run-a", 2).await;
        assert!(ledger.verify_chain("run-a").await.unwrap());

        let err = ledger.verify_against_anchor("run-a", &anchor).await.unwrap_err();
        assert!(
            matches!(violation(err), IntegrityViolation::FirstEntryMismatch { .. }),
            "rebuilt chain must not match the anchor"
        );
    }

    #[tokio::test]
    async fn rewritten_tail_is_a_root_hash_mismatch() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 3).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();

        let last = ledger.get_latest("run-a").await.unwrap().unwrap();
        sqlx::query("DELETE FROM run_ledger WHERE entry_id = ?")
            .bind(&last.entry_id)
            .execute(ledger.pool())
            .await
            .unwrap();
        append(&ledger, "run-a", 1).await;

        let err = ledger.verify_against_anchor("run-a", &anchor).await.unwrap_err();
        match violation(err) {
            IntegrityViolation::RootHashMismatch { position, expected, .. } => {
                assert_eq!(position, 3);
                assert_eq!(expected, last.entry_hash);
            }
            other => panic!("expected root hash mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forged_anchor_is_rejected() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 3).await;
        let mut anchor = ledger.export_anchor("run-a").await.unwrap();
        anchor.entry_count = 1;

        let err = ledger.verify_against_anchor("run-a", &anchor).await.unwrap_err();
        assert!(matches!(
            violation(err),
            IntegrityViolation::AnchorDigestMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn anchor_for_another_run_is_rejected() {
        let (_dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 1).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();
        let err = ledger.verify_against_anchor("run-b", &anchor).await.unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[tokio::test]
    async fn anchor_file_round_trip() {
        let (dir, ledger) = open_temp().await;
        append(&ledger, "run-a", 2).await;
        let anchor = ledger.export_anchor("run-a").await.unwrap();

        let path = dir.path().join("anchor.json");
        anchor.write_to(&path).await.unwrap();
        let loaded = LedgerAnchor::read_from(&path).await.unwrap();

        assert_eq!(loaded, anchor);
        assert!(loaded.is_self_consistent().unwrap());
        assert!(ledger.verify_against_anchor("run-a", &loaded).await.unwrap());
    }
}
