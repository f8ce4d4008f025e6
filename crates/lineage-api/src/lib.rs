use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lineage_core::{
    advance_generation, select_survivor, Account, Evolver, Genome, Identity, Lineage,
    LineageError, LineageId, LineageSummary,
};
use lineage_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, StoreOptions};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod drift;

pub use drift::DriftEvolver;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_CANDIDATE_COUNT: usize = 8;

type Result<T> = std::result::Result<T, LineageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_candidate_count: usize,
    pub max_candidate_count: usize,
    pub max_conflict_retries: u32,
    pub retry_backoff: Duration,
    pub busy_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_candidate_count: DEFAULT_CANDIDATE_COUNT,
            max_candidate_count: 1_024,
            max_conflict_retries: 3,
            retry_backoff: Duration::from_millis(25),
            busy_timeout: lineage_store_sqlite::DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Interpret a caller-supplied candidate count. Absent, blank, or
    /// non-numeric input falls back to the default.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for a count that is not positive
    /// or exceeds `max_candidate_count`.
    pub fn parse_candidate_count(&self, raw: Option<&str>) -> Result<usize> {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(self.default_candidate_count);
        };
        let Ok(count) = raw.parse::<i64>() else {
            return Ok(self.default_candidate_count);
        };
        if count <= 0 {
            return Err(LineageError::InvalidInput(format!(
                "candidate count MUST be positive, got {count}"
            )));
        }
        match usize::try_from(count) {
            Ok(count) if count <= self.max_candidate_count => Ok(count),
            _ => Err(LineageError::InvalidInput(format!(
                "candidate count MUST NOT exceed {}, got {count}",
                self.max_candidate_count
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateLineageRequest {
    pub genome: Genome,
    #[serde(default)]
    pub seed: Option<i64>,
}

#[derive(Clone)]
pub struct LineageApi {
    db_path: PathBuf,
    config: EngineConfig,
    evolver: Arc<dyn Evolver>,
}

impl Debug for LineageApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageApi")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LineageApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: EngineConfig::default(), evolver: Arc::new(DriftEvolver::default()) }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_evolver(mut self, evolver: Arc<dyn Evolver>) -> Self {
        self.evolver = evolver;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_options(
            &self.db_path,
            StoreOptions { busy_timeout: self.config.busy_timeout },
        )
    }

    fn open_for_caller(&self, identity: &Identity) -> Result<(SqliteStore, Account)> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let account = store.resolve_account(identity)?;
        Ok((store, account))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run database and ancestry integrity checks.
    ///
    /// # Errors
    /// Returns an error when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Resolve (and lazily create) the caller's account.
    ///
    /// # Errors
    /// Returns [`LineageError::Unauthenticated`] when the identity is unusable.
    pub fn resolve_account(&self, identity: &Identity) -> Result<Account> {
        self.retry_on_conflict("resolve_account", None, || {
            self.open_for_caller(identity).map(|(_, account)| account)
        })
    }

    /// Summaries of the caller's lineages, most recently updated first.
    ///
    /// # Errors
    /// Returns an error when the caller is unauthenticated or the listing fails.
    pub fn list_lineages(&self, identity: &Identity) -> Result<Vec<LineageSummary>> {
        self.retry_on_conflict("list_lineages", None, || {
            let (store, account) = self.open_for_caller(identity)?;
            store.list_summaries(&account.id)
        })
    }

    /// Create a lineage from a submitted genome and optional seed.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for a rejected genome, or an
    /// authentication/storage error.
    pub fn create_lineage(
        &self,
        identity: &Identity,
        request: CreateLineageRequest,
    ) -> Result<Lineage> {
        self.retry_on_conflict("create_lineage", None, || {
            let (mut store, account) = self.open_for_caller(identity)?;
            store.create_lineage(&account.id, request.genome.clone(), request.seed)
        })
    }

    /// Fetch one of the caller's lineages with its full ancestry.
    ///
    /// # Errors
    /// Returns [`LineageError::NotFound`] when the caller owns no such lineage
    /// and [`LineageError::Corrupt`] when its record cannot be decoded.
    pub fn get_lineage(&self, identity: &Identity, lineage_id: &str) -> Result<Lineage> {
        let id = LineageId::parse(lineage_id)?;
        self.retry_on_conflict("get_lineage", Some(id), || {
            let (store, account) = self.open_for_caller(identity)?;
            store.get_lineage(&account.id, id)
        })
    }

    /// Delete one of the caller's lineages.
    ///
    /// # Errors
    /// Returns [`LineageError::NotFound`] when the caller owns no such lineage.
    pub fn delete_lineage(&self, identity: &Identity, lineage_id: &str) -> Result<()> {
        let id = LineageId::parse(lineage_id)?;
        self.retry_on_conflict("delete_lineage", Some(id), || {
            let (mut store, account) = self.open_for_caller(identity)?;
            store.delete_lineage(&account.id, id)
        })
    }

    /// Produce candidate offspring from the lineage's current genome and
    /// persist the advanced generator seed. The candidates are not stored.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for a bad count, [`LineageError::NotFound`]
    /// for a foreign or missing lineage, and [`LineageError::Conflict`] when
    /// contention outlasts the retry budget.
    pub fn advance_generation(
        &self,
        identity: &Identity,
        lineage_id: &str,
        count: Option<&str>,
    ) -> Result<Vec<Genome>> {
        let id = LineageId::parse(lineage_id)?;
        let count = self.config.parse_candidate_count(count)?;
        let evolver = self.evolver.as_ref();

        let (candidates, owner) = self.retry_on_conflict("advance_generation", Some(id), || {
            let (mut store, account) = self.open_for_caller(identity)?;
            let candidates = store.update_lineage(&account.id, id, |lineage| {
                advance_generation(lineage, evolver, count, OffsetDateTime::now_utc())
            })?;
            Ok((candidates, account.id))
        })?;
        tracing::info!(lineage_id = %id, owner = %owner, count, "advanced generation");
        Ok(candidates)
    }

    /// Commit `survivor` as the lineage's current genome, moving the previous
    /// one onto the ancestry.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for a rejected genome,
    /// [`LineageError::NotFound`] for a foreign or missing lineage, and
    /// [`LineageError::Conflict`] when contention outlasts the retry budget.
    pub fn select_survivor(
        &self,
        identity: &Identity,
        lineage_id: &str,
        survivor: Genome,
    ) -> Result<()> {
        let id = LineageId::parse(lineage_id)?;
        survivor.validate()?;

        let (ancestor_count, owner) = self.retry_on_conflict("select_survivor", Some(id), || {
            let (mut store, account) = self.open_for_caller(identity)?;
            let ancestor_count = store.update_lineage(&account.id, id, |lineage| {
                select_survivor(lineage, survivor.clone(), OffsetDateTime::now_utc())?;
                Ok(lineage.ancestor_count())
            })?;
            Ok((ancestor_count, account.id))
        })?;
        tracing::info!(lineage_id = %id, owner = %owner, ancestor_count, "selected survivor");
        Ok(())
    }

    /// Each attempt reopens the store, so account resolution and the schema
    /// bootstrap are retried along with the lineage transaction.
    fn retry_on_conflict<T, F>(
        &self,
        operation: &str,
        id: Option<LineageId>,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let lineage_id = id.map(|id| id.to_string()).unwrap_or_default();
        let mut retries = 0;
        loop {
            match attempt() {
                Err(err) if err.is_retryable() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    tracing::warn!(
                        operation,
                        lineage_id = %lineage_id,
                        retries,
                        error = %err,
                        "lineage transaction conflicted; retrying"
                    );
                    thread::sleep(self.config.retry_backoff * retries);
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(
                            operation,
                            lineage_id = %lineage_id,
                            retries,
                            "conflict retries exhausted"
                        );
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}
