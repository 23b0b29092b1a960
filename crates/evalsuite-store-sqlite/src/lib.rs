#![allow(clippy::missing_errors_doc)]

//! SQLite-backed suite ledger: suite records, the per-suite
//! configuration version counters, and evaluation rows.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use evalsuite_core::{DatasetId, EvalId, SuiteError, SuiteId, SuiteLedger, VersionPair};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS suites (
  suite_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  dataset_id TEXT,
  current_config_version INTEGER NOT NULL DEFAULT 0 CHECK (current_config_version >= 0),
  latest_config_version INTEGER NOT NULL DEFAULT 0 CHECK (latest_config_version >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (current_config_version <= latest_config_version)
);

CREATE TABLE IF NOT EXISTS evaluations (
  eval_id TEXT PRIMARY KEY,
  suite_id TEXT NOT NULL,
  config_version INTEGER NOT NULL CHECK (config_version >= 0),
  created_at TEXT NOT NULL,
  FOREIGN KEY (suite_id) REFERENCES suites(suite_id)
);

CREATE INDEX IF NOT EXISTS idx_evaluations_suite_created
  ON evaluations(suite_id, created_at);
";

/// A suite row as stored in the ledger.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SuiteRecord {
    pub suite_id: SuiteId,
    pub name: String,
    pub description: String,
    pub dataset_id: Option<DatasetId>,
    pub current_config_version: u32,
    pub latest_config_version: u32,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SqliteSuiteLedger {
    conn: Connection,
}

impl SqliteSuiteLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    pub fn create_suite(
        &self,
        name: &str,
        description: &str,
        dataset_id: Option<DatasetId>,
    ) -> Result<SuiteRecord> {
        if name.trim().is_empty() {
            return Err(anyhow!("suite name must not be empty"));
        }

        let suite_id = SuiteId(Ulid::new());
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO suites(
                    suite_id, name, description, dataset_id,
                    current_config_version, latest_config_version,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)",
                params![
                    suite_id.to_string(),
                    name,
                    description,
                    dataset_id.map(|id| id.to_string()),
                    now,
                ],
            )
            .context("failed to insert suite row")?;

        tracing::info!(suite = %suite_id, name, "created suite");

        Ok(SuiteRecord {
            suite_id,
            name: name.to_string(),
            description: description.to_string(),
            dataset_id,
            current_config_version: 0,
            latest_config_version: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_suite(&self, suite: &SuiteId) -> Result<Option<SuiteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT suite_id, name, description, dataset_id,
                    current_config_version, latest_config_version,
                    created_at, updated_at
             FROM suites
             WHERE suite_id = ?1",
        )?;

        let row = stmt
            .query_row(params![suite.to_string()], parse_suite_row)
            .optional()?;

        Ok(row)
    }

    pub fn list_suites(&self) -> Result<Vec<SuiteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT suite_id, name, description, dataset_id,
                    current_config_version, latest_config_version,
                    created_at, updated_at
             FROM suites
             ORDER BY created_at ASC, suite_id ASC",
        )?;

        let rows = stmt.query_map([], parse_suite_row)?;
        let mut suites = Vec::new();
        for row in rows {
            suites.push(row?);
        }
        Ok(suites)
    }

    pub fn set_dataset(&self, suite: &SuiteId, dataset: Option<DatasetId>) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE suites SET dataset_id = ?2, updated_at = ?3 WHERE suite_id = ?1",
                params![
                    suite.to_string(),
                    dataset.map(|id| id.to_string()),
                    now_rfc3339()?,
                ],
            )
            .context("failed to update suite dataset")?;

        if changed == 0 {
            return Err(anyhow!("suite {suite} does not exist"));
        }
        Ok(())
    }

    /// Records one completed evaluation for the suite. Once any row
    /// exists the suite's configuration is frozen outside the
    /// invocation section.
    pub fn record_evaluation(
        &self,
        suite: &SuiteId,
        eval_id: EvalId,
        config_version: u32,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO evaluations(eval_id, suite_id, config_version, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    eval_id.to_string(),
                    suite.to_string(),
                    i64::from(config_version),
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert evaluation row")?;
        Ok(())
    }

    pub fn count_evaluations(&self, suite: &SuiteId) -> Result<usize> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM evaluations WHERE suite_id = ?1",
                params![suite.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count evaluations")?;
        usize::try_from(count).with_context(|| format!("invalid evaluation count: {count}"))
    }

    fn versions_row(&self, suite: &SuiteId) -> Result<Option<VersionPair>> {
        let mut stmt = self.conn.prepare(
            "SELECT current_config_version, latest_config_version
             FROM suites
             WHERE suite_id = ?1",
        )?;

        let row = stmt
            .query_row(params![suite.to_string()], |row| {
                let current: i64 = row.get(0)?;
                let latest: i64 = row.get(1)?;
                Ok((current, latest))
            })
            .optional()?;

        let Some((current_i64, latest_i64)) = row else {
            return Ok(None);
        };

        let current = u32::try_from(current_i64)
            .with_context(|| format!("invalid current_config_version: {current_i64}"))?;
        let latest = u32::try_from(latest_i64)
            .with_context(|| format!("invalid latest_config_version: {latest_i64}"))?;
        Ok(Some(VersionPair { current, latest }))
    }
}

impl SuiteLedger for SqliteSuiteLedger {
    fn suite_exists(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
        self.conn
            .query_row(
                "SELECT 1 FROM suites WHERE suite_id = ?1 LIMIT 1",
                params![suite.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(storage_error)
    }

    fn dataset_id(&self, suite: &SuiteId) -> Result<Option<DatasetId>, SuiteError> {
        let raw = self
            .conn
            .query_row(
                "SELECT dataset_id FROM suites WHERE suite_id = ?1",
                params![suite.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map_err(storage_error)?
            .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))?;

        raw.as_deref().map(DatasetId::parse).transpose()
    }

    fn has_evaluations(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
        self.conn
            .query_row(
                "SELECT 1 FROM evaluations WHERE suite_id = ?1 LIMIT 1",
                params![suite.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(storage_error)
    }

    fn increment_latest(&self, suite: &SuiteId) -> Result<u32, SuiteError> {
        // Single-statement increment-and-read: concurrent callers each
        // observe a distinct version number.
        let latest = self
            .conn
            .query_row(
                "UPDATE suites
                 SET latest_config_version = latest_config_version + 1,
                     updated_at = ?2
                 WHERE suite_id = ?1
                 RETURNING latest_config_version",
                params![suite.to_string(), now_rfc3339().map_err(storage_error)?],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(storage_error)?
            .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))?;

        u32::try_from(latest)
            .map_err(|_| SuiteError::Storage(format!("invalid latest_config_version: {latest}")))
    }

    fn set_current(&self, suite: &SuiteId, version: u32) -> Result<(), SuiteError> {
        let changed = self
            .conn
            .execute(
                "UPDATE suites
                 SET current_config_version = ?2, updated_at = ?3
                 WHERE suite_id = ?1 AND latest_config_version >= ?2",
                params![
                    suite.to_string(),
                    i64::from(version),
                    now_rfc3339().map_err(storage_error)?,
                ],
            )
            .map_err(storage_error)?;

        if changed == 0 {
            let versions = self.get_versions(suite)?;
            return Err(SuiteError::Validation(format!(
                "version {version} outside [0, {}]",
                versions.latest
            )));
        }
        Ok(())
    }

    fn get_versions(&self, suite: &SuiteId) -> Result<VersionPair, SuiteError> {
        self.versions_row(suite)
            .map_err(storage_error)?
            .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))
    }

    fn pin_initial(&self, suite: &SuiteId) -> Result<(), SuiteError> {
        let changed = self
            .conn
            .execute(
                "UPDATE suites
                 SET current_config_version = 0,
                     latest_config_version = 0,
                     updated_at = ?2
                 WHERE suite_id = ?1",
                params![suite.to_string(), now_rfc3339().map_err(storage_error)?],
            )
            .map_err(storage_error)?;

        if changed == 0 {
            return Err(SuiteError::NotFound(format!("suite {suite} does not exist")));
        }
        Ok(())
    }
}

fn parse_suite_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SuiteRecord> {
    let suite_id_raw: String = row.get(0)?;
    let dataset_id_raw: Option<String> = row.get(3)?;
    let current_i64: i64 = row.get(4)?;
    let latest_i64: i64 = row.get(5)?;

    let suite_id = Ulid::from_string(&suite_id_raw)
        .map(SuiteId)
        .map_err(|_| invalid_column(0, format!("invalid suite_id ULID: {suite_id_raw}")))?;

    let dataset_id = dataset_id_raw
        .as_deref()
        .map(|raw| {
            Ulid::from_string(raw)
                .map(DatasetId)
                .map_err(|_| invalid_column(3, format!("invalid dataset_id ULID: {raw}")))
        })
        .transpose()?;

    let current_config_version = u32::try_from(current_i64)
        .map_err(|_| invalid_column(4, format!("invalid current_config_version: {current_i64}")))?;
    let latest_config_version = u32::try_from(latest_i64)
        .map_err(|_| invalid_column(5, format!("invalid latest_config_version: {latest_i64}")))?;

    Ok(SuiteRecord {
        suite_id,
        name: row.get(1)?,
        description: row.get(2)?,
        dataset_id,
        current_config_version,
        latest_config_version,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format timestamp")
}

fn storage_error(err: impl std::fmt::Display) -> SuiteError {
    SuiteError::Storage(err.to_string())
}
