//! Durable desired-state store.
//!
//! One SQLite table maps `job_id → (tenant, spec)`. This is the only
//! persistent state in the system; pool and warm state are rebuilt from it
//! after a restart. A one-connection pool keeps the single-writer property
//! structural, and every read is a snapshot; the reconciler never holds a
//! transaction across its diff.

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::spec::VmSpec;

/// One desired entry: a job that should be backed by exactly one VM.
#[derive(Debug, Clone)]
pub struct DesiredJob {
    pub job_id: String,
    pub tenant: String,
    pub spec: VmSpec,
}

/// Declarative bootstrap file: a list of desired jobs in TOML.
#[derive(Debug, Deserialize)]
struct DesiredFile {
    #[serde(default)]
    jobs: Vec<DesiredFileEntry>,
}

#[derive(Debug, Deserialize)]
struct DesiredFileEntry {
    job_id: String,
    /// Defaults to the job id when omitted.
    tenant: Option<String>,
    spec: VmSpec,
}

#[derive(Clone)]
pub struct DesiredStore {
    pool: SqlitePool,
}

impl DesiredStore {
    /// Open (or create) the store at the given path, WAL enabled.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(options).await
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse().map_err(Error::from)?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS desired_jobs (
                job_id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                spec_json TEXT NOT NULL,
                inserted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// UPSERT: replaces any existing row for `job_id`. Durable on return.
    pub async fn put(&self, job_id: &str, tenant: &str, spec: &VmSpec) -> Result<()> {
        let spec_json = serde_json::to_string(spec)
            .map_err(|e| Error::StoreUnavailable(format!("encoding spec: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO desired_jobs (job_id, tenant, spec_json, inserted_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(job_id) DO UPDATE SET
                tenant = excluded.tenant,
                spec_json = excluded.spec_json,
                inserted_at = excluded.inserted_at
            "#,
        )
        .bind(job_id)
        .bind(tenant)
        .bind(spec_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent delete.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM desired_jobs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch one record, or `None` on a miss.
    pub async fn get(&self, job_id: &str) -> Result<Option<DesiredJob>> {
        let row = sqlx::query("SELECT tenant, spec_json FROM desired_jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let tenant: String = row.get("tenant");
                let spec_json: String = row.get("spec_json");
                let spec = serde_json::from_str(&spec_json).map_err(|e| {
                    Error::StoreUnavailable(format!("corrupt spec for {}: {}", job_id, e))
                })?;
                Ok(Some(DesiredJob {
                    job_id: job_id.to_string(),
                    tenant,
                    spec,
                }))
            }
            None => Ok(None),
        }
    }

    /// Snapshot of all records keyed by job id. Rows whose spec no longer
    /// parses are logged and skipped rather than wedging the reconciler.
    pub async fn list(&self) -> Result<HashMap<String, DesiredJob>> {
        let rows = sqlx::query("SELECT job_id, tenant, spec_json FROM desired_jobs")
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = HashMap::with_capacity(rows.len());
        for row in rows {
            let job_id: String = row.get("job_id");
            let tenant: String = row.get("tenant");
            let spec_json: String = row.get("spec_json");
            match serde_json::from_str(&spec_json) {
                Ok(spec) => {
                    jobs.insert(job_id.clone(), DesiredJob { job_id, tenant, spec });
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "skipping corrupt desired entry");
                }
            }
        }
        Ok(jobs)
    }

    /// Snapshot of all desired job ids.
    pub async fn job_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT job_id FROM desired_jobs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("job_id")).collect())
    }

    /// Wipe every record. Test support; not exposed over HTTP.
    pub async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM desired_jobs")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load a declarative desired-state file and UPSERT every entry.
    ///
    /// Runs once at startup. A missing file starts empty; a file that fails
    /// to parse or validate logs an error and leaves the store empty.
    /// Returns the number of entries loaded.
    pub async fn bootstrap_from_file(&self, path: &Path) -> usize {
        if !path.exists() {
            info!(path = %path.display(), "no desired-state file, starting empty");
            return 0;
        }

        let jobs = match load_desired_file(path) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load desired-state file");
                return 0;
            }
        };

        let mut loaded = 0;
        for job in jobs {
            match self.put(&job.job_id, &job.tenant, &job.spec).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "failed to store desired entry");
                }
            }
        }
        info!(count = loaded, path = %path.display(), "desired state bootstrapped");
        loaded
    }
}

/// Parse and validate a desired-state file into its job entries.
pub fn load_desired_file(path: &Path) -> anyhow::Result<Vec<DesiredJob>> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: DesiredFile =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    let mut jobs = Vec::with_capacity(parsed.jobs.len());
    for entry in parsed.jobs {
        if entry.job_id.is_empty() {
            anyhow::bail!("desired-state entry with empty job_id");
        }
        entry
            .spec
            .validate()
            .with_context(|| format!("job {}", entry.job_id))?;
        let tenant = entry.tenant.unwrap_or_else(|| entry.job_id.clone());
        jobs.push(DesiredJob {
            job_id: entry.job_id,
            tenant,
            spec: entry.spec,
        });
    }
    Ok(jobs)
}
