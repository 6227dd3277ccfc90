use std::path::{Path, PathBuf};
use std::time::Duration;

use std::fmt;

use corvus_types::{timestamp_serde, CorvusError, EntryDraft, IntegrityViolation, LedgerEntry, Result};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::Mutex;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS run_ledger (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id              TEXT    NOT NULL UNIQUE,
    run_id                TEXT    NOT NULL,
    stage_id              TEXT    NOT NULL,
    state_transition      TEXT    NOT NULL,
    timestamp_utc         TEXT    NOT NULL,
    input_hash            TEXT    NOT NULL DEFAULT '',
    output_hash           TEXT    NOT NULL DEFAULT '',
    artifact_refs_json    TEXT    NOT NULL DEFAULT '[]',
    pipeline_version      TEXT    NOT NULL,
    schema_version        TEXT    NOT NULL,
    toolchain_version     TEXT    NOT NULL,
    ruleset_versions_json TEXT    NOT NULL DEFAULT '{}',
    waiver_refs_json      TEXT    NOT NULL DEFAULT '[]',
    payload_hash          TEXT    NOT NULL DEFAULT '',
    previous_entry_hash   TEXT    NOT NULL DEFAULT '',
    entry_hash            TEXT    NOT NULL UNIQUE,
    trust_context_json    TEXT    NOT NULL DEFAULT '{}',
    trust_context_version TEXT    NOT NULL DEFAULT '1'
)
"#;

const CREATE_IDX_RUN: &str = "CREATE INDEX IF NOT EXISTS idx_run_id ON run_ledger(run_id, id)";

const CREATE_IDX_RUN_STAGE: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_stage ON run_ledger(run_id, stage_id, id)";

const SELECT_COLUMNS: &str = r#"
SELECT id, entry_id, run_id, stage_id, state_transition, timestamp_utc,
       input_hash, output_hash, artifact_refs_json,
       pipeline_version, schema_version, toolchain_version,
       ruleset_versions_json, waiver_refs_json, payload_hash,
       previous_entry_hash, entry_hash, trust_context_json, trust_context_version
FROM run_ledger
"#;

pub(crate) fn storage(err: sqlx::Error) -> CorvusError {
    CorvusError::Storage(err.to_string())
}

/// Append-only, hash-chained ledger of stage transitions.
///
/// [`RunLedger::append`] is the only write. There is no update and no delete;
/// integrity rests entirely on the per-run hash chain, which
/// [`RunLedger::verify_chain`] recomputes from what is on disk.
pub struct RunLedger {
    pool: SqlitePool,
    path: PathBuf,
    /// Serializes appends so "read latest hash, then insert" is atomic.
    write_lock: Mutex<()>,
}

impl RunLedger {
    /// Open (or create) the ledger at `path` with the default pool size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn open_with(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(storage)?;

        for ddl in [CREATE_LEDGER, CREATE_IDX_RUN, CREATE_IDX_RUN_STAGE] {
            sqlx::query(ddl).execute(&pool).await.map_err(storage)?;
        }
        tracing::debug!(path = %path.display(), "Ledger schema ready");

        Ok(Self {
            pool,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every pooled connection, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Link `draft` to the latest entry of its run, seal it, and persist it.
    ///
    /// The lookup and insert run in one transaction under the writer lock, so
    /// the append either lands with a correct link or does not happen at all.
    pub async fn append(&self, draft: EntryDraft) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let previous: Option<String> = sqlx::query_scalar(
            "SELECT entry_hash FROM run_ledger WHERE run_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&draft.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let sealed = draft.seal(previous.unwrap_or_default())?;
        let encoded = EncodedColumns::of(&sealed)?;

        sqlx::query(
            r#"
            INSERT INTO run_ledger
                (entry_id, run_id, stage_id, state_transition, timestamp_utc,
                 input_hash, output_hash, artifact_refs_json,
                 pipeline_version, schema_version, toolchain_version,
                 ruleset_versions_json, waiver_refs_json, payload_hash,
                 previous_entry_hash, entry_hash, trust_context_json, trust_context_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sealed.entry_id)
        .bind(&sealed.run_id)
        .bind(&sealed.stage_id)
        .bind(&sealed.state_transition)
        .bind(&encoded.timestamp_utc)
        .bind(&sealed.input_hash)
        .bind(&sealed.output_hash)
        .bind(&encoded.artifact_refs_json)
        .bind(&sealed.pipeline_version)
        .bind(&sealed.schema_version)
        .bind(&sealed.toolchain_version)
        .bind(&encoded.ruleset_versions_json)
        .bind(&encoded.waiver_refs_json)
        .bind(&sealed.payload_hash)
        .bind(&sealed.previous_entry_hash)
        .bind(&sealed.entry_hash)
        .bind(&encoded.trust_context_json)
        .bind(&sealed.trust_context_version)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        tracing::debug!(
            run_id = %sealed.run_id,
            stage_id = %sealed.stage_id,
            transition = %sealed.state_transition,
            entry_hash = %sealed.entry_hash,
            "Ledger entry appended"
        );
        Ok(sealed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All entries of a run in append order.
    pub async fn get_run_entries(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(|row| StoredEntry::decode(row).map(|s| s.entry)).collect()
    }

    pub async fn get_stage_history(&self, run_id: &str, stage_id: &str) -> Result<Vec<LedgerEntry>> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = ? AND stage_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .bind(stage_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(|row| StoredEntry::decode(row).map(|s| s.entry)).collect()
    }

    pub async fn get_latest(&self, run_id: &str) -> Result<Option<LedgerEntry>> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = ? ORDER BY id DESC LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref()
            .map(|row| StoredEntry::decode(row).map(|s| s.entry))
            .transpose()
    }

    /// Distinct run ids, most recently written first.
    pub async fn get_all_run_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT run_id FROM run_ledger GROUP BY run_id ORDER BY MAX(id) DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)
    }

    pub async fn entry_count(&self, run_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_ledger WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count.max(0) as usize)
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Walk a run's chain and recompute every seal from the stored rows.
    ///
    /// Returns `Ok(true)` for an intact chain (including an empty run). The
    /// first undecodable row, non-canonical column, broken link or seal
    /// mismatch is returned as [`CorvusError::LedgerIntegrity`] naming the
    /// offending entry.
    pub async fn verify_chain(&self, run_id: &str) -> Result<bool> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        match walk_chain(&rows) {
            Ok(count) => {
                tracing::debug!(run_id = %run_id, entries = count, "Ledger chain verified");
                Ok(true)
            }
            Err(err) => {
                if err.is_integrity_failure() {
                    tracing::error!(run_id = %run_id, error = %err, "Ledger chain verification failed");
                }
                Err(err)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn walk_chain(rows: &[SqliteRow]) -> Result<usize> {
    let mut expected_previous = String::new();
    for row in rows {
        let stored = StoredEntry::decode(row)?;
        stored.check_encoding()?;
        check_entry(&stored.entry, &expected_previous)?;
        expected_previous = stored.entry.entry_hash;
    }
    Ok(rows.len())
}

/// Link and seal check for one entry against its predecessor's hash.
fn check_entry(entry: &LedgerEntry, expected_previous: &str) -> Result<()> {
    if entry.previous_entry_hash != expected_previous {
        return Err(IntegrityViolation::BrokenLink {
            entry_id: entry.entry_id.clone(),
            expected: expected_previous.to_string(),
            actual: entry.previous_entry_hash.clone(),
        }
        .into());
    }

    let recomputed = entry.compute_hash()?;
    if recomputed != entry.entry_hash {
        return Err(IntegrityViolation::HashMismatch {
            entry_id: entry.entry_id.clone(),
            expected: recomputed,
            actual: entry.entry_hash.clone(),
        }
        .into());
    }
    Ok(())
}

fn corrupt(entry_id: &str, column: &str, detail: impl fmt::Display) -> CorvusError {
    IntegrityViolation::CorruptEntry {
        entry_id: entry_id.to_string(),
        column: column.to_string(),
        detail: detail.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Row codec
// ---------------------------------------------------------------------------

/// Stored text of the columns that are not plain strings on the entry.
///
/// Appends write exactly these strings, so an untouched row always holds
/// them byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EncodedColumns {
    timestamp_utc: String,
    artifact_refs_json: String,
    ruleset_versions_json: String,
    waiver_refs_json: String,
    trust_context_json: String,
}

impl EncodedColumns {
    fn of(entry: &LedgerEntry) -> Result<Self> {
        Ok(Self {
            timestamp_utc: timestamp_serde::format(&entry.timestamp_utc),
            artifact_refs_json: serde_json::to_string(&entry.artifact_references)?,
            ruleset_versions_json: serde_json::to_string(&entry.ruleset_versions)?,
            waiver_refs_json: serde_json::to_string(&entry.waiver_references)?,
            trust_context_json: serde_json::to_string(&entry.trust_context)?,
        })
    }

    fn columns(&self) -> [(&'static str, &str); 5] {
        [
            ("timestamp_utc", &self.timestamp_utc),
            ("artifact_refs_json", &self.artifact_refs_json),
            ("ruleset_versions_json", &self.ruleset_versions_json),
            ("waiver_refs_json", &self.waiver_refs_json),
            ("trust_context_json", &self.trust_context_json),
        ]
    }
}

/// A decoded row together with the raw text it was decoded from.
struct StoredEntry {
    entry: LedgerEntry,
    stored: EncodedColumns,
}

impl StoredEntry {
    /// Decode a row. Any column that cannot be read or parsed is reported as
    /// a corrupt entry, identified by `entry_id` (or by row id if even that
    /// is unreadable).
    fn decode(row: &SqliteRow) -> Result<Self> {
        let entry_id: String = match row.try_get("entry_id") {
            Ok(id) => id,
            Err(err) => {
                let id: i64 = row.try_get("id").unwrap_or_default();
                return Err(corrupt(&format!("row #{id}"), "entry_id", err));
            }
        };
        let text = |column: &str| -> Result<String> {
            row.try_get(column).map_err(|e| corrupt(&entry_id, column, e))
        };

        let stored = EncodedColumns {
            timestamp_utc: text("timestamp_utc")?,
            artifact_refs_json: text("artifact_refs_json")?,
            ruleset_versions_json: text("ruleset_versions_json")?,
            waiver_refs_json: text("waiver_refs_json")?,
            trust_context_json: text("trust_context_json")?,
        };
        let timestamp_utc = timestamp_serde::parse(&stored.timestamp_utc)
            .map_err(|e| corrupt(&entry_id, "timestamp_utc", e))?;

        let entry = LedgerEntry {
            run_id: text("run_id")?,
            stage_id: text("stage_id")?,
            state_transition: text("state_transition")?,
            timestamp_utc,
            input_hash: text("input_hash")?,
            output_hash: text("output_hash")?,
            artifact_references: parse_json(&entry_id, "artifact_refs_json", &stored.artifact_refs_json)?,
            pipeline_version: text("pipeline_version")?,
            schema_version: text("schema_version")?,
            toolchain_version: text("toolchain_version")?,
            ruleset_versions: parse_json(&entry_id, "ruleset_versions_json", &stored.ruleset_versions_json)?,
            waiver_references: parse_json(&entry_id, "waiver_refs_json", &stored.waiver_refs_json)?,
            payload_hash: text("payload_hash")?,
            trust_context: parse_json(&entry_id, "trust_context_json", &stored.trust_context_json)?,
            trust_context_version: text("trust_context_version")?,
            previous_entry_hash: text("previous_entry_hash")?,
            entry_hash: text("entry_hash")?,
            entry_id,
        };
        Ok(Self { entry, stored })
    }

    /// The stored text must be exactly what an append of the decoded entry
    /// would have written, so the seal covers the bytes on disk.
    fn check_encoding(&self) -> Result<()> {
        let canonical = EncodedColumns::of(&self.entry)?;
        for ((column, stored), (_, expected)) in self.stored.columns().into_iter().zip(canonical.columns()) {
            if stored != expected {
                return Err(corrupt(
                    &self.entry.entry_id,
                    column,
                    format!("stored {stored:?} is not the canonical encoding {expected:?}"),
                ));
            }
        }
        Ok(())
    }
}

fn parse_json<T: DeserializeOwned>(entry_id: &str, column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| corrupt(entry_id, column, e))
}
