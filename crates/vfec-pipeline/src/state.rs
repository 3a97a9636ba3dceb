//! SQLite ledger of per-unit progress.
//!
//! Each (project, commit, test) unit has one row holding its current stage,
//! the time it last changed, and the serialized results gathered so far.
//! Re-running a pair consults the ledger and skips units that already
//! reached a terminal stage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use vfec_core::{UnitKey, UnitStage, VfecError};
use vfec_coverage::lcov::CoverageIndex;
use vfec_energy::EnergyReport;

/// Results stored with a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRecord {
    /// Whether the instrumented test run exited successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_passed: Option<bool>,
    /// Source files with coverage accumulators after the test run.
    #[serde(default)]
    pub touched: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyReport>,
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub key: UnitKey,
    pub stage: UnitStage,
    pub updated_at: DateTime<Utc>,
}

/// Resumable stage ledger.
///
/// # Examples
///
/// ```
/// use vfec_core::{UnitKey, UnitStage};
/// use vfec_pipeline::StateLedger;
///
/// let ledger = StateLedger::in_memory().unwrap();
/// let key = UnitKey { project: "curl".into(), commit: "da0db499".into(), test: "1".into() };
/// ledger.advance(&key, UnitStage::Built).unwrap();
/// assert_eq!(ledger.stage(&key).unwrap(), Some(UnitStage::Built));
/// assert!(!ledger.stage(&key).unwrap().is_some_and(UnitStage::is_terminal));
/// ```
pub struct StateLedger {
    conn: Connection,
}

impl StateLedger {
    /// Open or create a ledger at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Database`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, VfecError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VfecError::Database(format!("failed to create ledger directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| VfecError::Database(format!("failed to open ledger: {e}")))?;

        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// In-memory ledger (for tests and one-shot runs).
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Database`] if schema creation fails.
    pub fn in_memory() -> Result<Self, VfecError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            VfecError::Database(format!("failed to create in-memory ledger: {e}"))
        })?;

        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), VfecError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS units (
                    project TEXT NOT NULL,
                    commit_hash TEXT NOT NULL,
                    test TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    payload TEXT,
                    PRIMARY KEY (project, commit_hash, test)
                );
                ",
            )
            .map_err(|e| VfecError::Database(format!("failed to create schema: {e}")))
    }

    pub fn stage(&self, key: &UnitKey) -> Result<Option<UnitStage>, VfecError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT stage FROM units WHERE project = ?1 AND commit_hash = ?2 AND test = ?3",
                params![key.project, key.commit, key.test],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| VfecError::Database(format!("failed to read stage of {key}: {e}")))?;

        raw.map(|s| s.parse::<UnitStage>().map_err(VfecError::Database))
            .transpose()
    }

    /// Move `key` to `stage`, keeping any stored results.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Database`] on write failure.
    pub fn advance(&self, key: &UnitKey, stage: UnitStage) -> Result<(), VfecError> {
        self.conn
            .execute(
                "INSERT INTO units (project, commit_hash, test, stage, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT (project, commit_hash, test)
                 DO UPDATE SET stage = excluded.stage, updated_at = excluded.updated_at",
                params![
                    key.project,
                    key.commit,
                    key.test,
                    stage.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| VfecError::Database(format!("failed to advance {key}: {e}")))?;
        Ok(())
    }

    /// Move `key` to `stage` and replace its stored results.
    ///
    /// # Errors
    ///
    /// Returns [`VfecError::Serialization`] if `record` cannot be encoded, or
    /// [`VfecError::Database`] on write failure.
    pub fn store(
        &self,
        key: &UnitKey,
        stage: UnitStage,
        record: &UnitRecord,
    ) -> Result<(), VfecError> {
        let payload = serde_json::to_string(record)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO units (project, commit_hash, test, stage, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.project,
                    key.commit,
                    key.test,
                    stage.as_str(),
                    Utc::now().to_rfc3339(),
                    payload
                ],
            )
            .map_err(|e| VfecError::Database(format!("failed to store {key}: {e}")))?;
        Ok(())
    }

    /// Stored results for `key`, if any.
    pub fn record(&self, key: &UnitKey) -> Result<Option<UnitRecord>, VfecError> {
        let payload: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT payload FROM units WHERE project = ?1 AND commit_hash = ?2 AND test = ?3",
                params![key.project, key.commit, key.test],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| VfecError::Database(format!("failed to read results of {key}: {e}")))?;

        match payload.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Every unit of `project`, or of all projects, ordered by key.
    pub fn units(&self, project: Option<&str>) -> Result<Vec<UnitStatus>, VfecError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT project, commit_hash, test, stage, updated_at FROM units
                 WHERE ?1 IS NULL OR project = ?1
                 ORDER BY project, commit_hash, test",
            )
            .map_err(|e| VfecError::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![project], |row| {
                Ok((
                    UnitKey {
                        project: row.get(0)?,
                        commit: row.get(1)?,
                        test: row.get(2)?,
                    },
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| VfecError::Database(format!("failed to list units: {e}")))?;

        let mut units = Vec::new();
        for row in rows {
            let (key, stage, updated_at) =
                row.map_err(|e| VfecError::Database(format!("failed to read unit row: {e}")))?;
            let stage = stage.parse::<UnitStage>().map_err(VfecError::Database)?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| VfecError::Database(format!("bad timestamp for {key}: {e}")))?
                .with_timezone(&Utc);
            units.push(UnitStatus {
                key,
                stage,
                updated_at,
            });
        }
        Ok(units)
    }

    /// Drop `key` so the next run processes it from scratch.
    pub fn forget(&self, key: &UnitKey) -> Result<bool, VfecError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM units WHERE project = ?1 AND commit_hash = ?2 AND test = ?3",
                params![key.project, key.commit, key.test],
            )
            .map_err(|e| VfecError::Database(format!("failed to forget {key}: {e}")))?;
        Ok(removed > 0)
    }
}
