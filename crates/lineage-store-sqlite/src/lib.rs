use std::path::Path;
use std::time::Duration;

use lineage_core::{
    decode_ancestry, decode_lineage, encode_lineage, Account, AccountId, Genome, Identity,
    Lineage, LineageError, LineageId, LineageSummary, PersistedLineage,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

type Result<T> = std::result::Result<T, LineageError>;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
  account_id TEXT PRIMARY KEY,
  email TEXT NOT NULL,
  external_id TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lineages (
  lineage_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL REFERENCES accounts(account_id),
  generator_seed INTEGER NOT NULL,
  current_json TEXT NOT NULL,
  ancestry_blob BLOB NOT NULL,
  ancestor_count INTEGER NOT NULL CHECK (ancestor_count >= 0),
  created_at_ns INTEGER NOT NULL,
  updated_at_ns INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lineages_owner_updated
  ON lineages(owner_id, updated_at_ns DESC);
";

const SELECT_LINEAGE_COLUMNS: &str = "lineage_id, owner_id, generator_seed, current_json, \
     ancestry_blob, ancestor_count, created_at_ns, updated_at_ns";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a writer waits on a locked database before reporting a conflict.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptLineage {
    pub lineage_id: String,
    pub owner_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub corrupt_lineages: Vec<CorruptLineage>,
    pub schema_status: SchemaStatus,
}

struct LineageRow {
    lineage_id: String,
    owner_id: String,
    generator_seed: i64,
    current_json: String,
    ancestry_blob: Vec<u8>,
    ancestor_count: i64,
    created_at_ns: i64,
    updated_at_ns: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed lineage store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open a SQLite-backed lineage store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_error(&format!(
            "failed to open sqlite database at {}",
            path.display()
        )))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(sql_error("failed to configure sqlite pragmas"))?;
        conn.busy_timeout(options.busy_timeout)
            .map_err(sql_error("failed to configure sqlite busy timeout"))?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(sql_error("failed to apply schema_migrations table"))?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(sql_error("failed to apply schema_migrations table"))?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(LineageError::Storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error("failed to start migration v1 transaction"))?;
        tx.execute_batch(MIGRATION_001_SQL).map_err(sql_error("failed to apply migration v1"))?;
        let applied = tx
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .map_err(sql_error("failed to record migration version 1"))?;
        tx.commit().map_err(sql_error("failed to commit migration v1"))?;

        if applied == 1 {
            tracing::info!(version = 1, "applied lineage schema migration");
        }
        Ok(())
    }

    /// Map an authenticated caller to its account, creating it on first sight.
    ///
    /// # Errors
    /// Returns [`LineageError::Unauthenticated`] when the identity carries no
    /// usable identifier, or a storage error when the account cannot be written.
    pub fn resolve_account(&mut self, identity: &Identity) -> Result<Account> {
        let account_id = identity.account_id()?;
        let created = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO accounts(account_id, email, external_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    account_id.as_str(),
                    identity.email.trim(),
                    identity.external_id.as_deref().map(str::trim).filter(|id| !id.is_empty()),
                    now_rfc3339()?,
                ],
            )
            .map_err(sql_error("failed to insert account"))?;
        if created == 1 {
            tracing::info!(account_id = %account_id, "created account on first access");
        }

        self.get_account(&account_id)?.ok_or_else(|| {
            LineageError::Storage(format!("account {account_id} vanished after insert"))
        })
    }

    /// Look up an account by its stable identifier.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let row = self
            .conn
            .query_row(
                "SELECT account_id, email, external_id, created_at FROM accounts WHERE account_id = ?1",
                params![account_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_error("failed to read account"))?;

        row.map(|(id, email, external_id, created_at)| {
            Ok(Account {
                id: AccountId::new(id),
                email,
                external_id,
                created_at: parse_rfc3339(&created_at)?,
            })
        })
        .transpose()
    }

    /// Persist a fresh lineage for `owner` starting from `genome`.
    ///
    /// # Errors
    /// Returns [`LineageError::InvalidInput`] for a rejected genome, or a storage
    /// error when the insert fails (for example when the owner has no account).
    pub fn create_lineage(
        &mut self,
        owner: &AccountId,
        genome: Genome,
        seed: Option<i64>,
    ) -> Result<Lineage> {
        let mut lineage = Lineage::new(owner.clone(), genome, seed, OffsetDateTime::now_utc())?;
        let id = self.save_lineage(&mut lineage)?;
        tracing::info!(lineage_id = %id, owner = %owner, "created lineage");
        Ok(lineage)
    }

    /// Upsert a lineage by id, assigning one when it has none yet.
    ///
    /// # Errors
    /// Returns [`LineageError::NotFound`] when the id belongs to another account,
    /// or a codec/storage error; nothing is written in that case.
    pub fn save_lineage(&mut self, lineage: &mut Lineage) -> Result<LineageId> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error("failed to start lineage save transaction"))?;
        let id = write_lineage(&tx, lineage)?;
        tx.commit().map_err(sql_error("failed to commit lineage save transaction"))?;
        Ok(id)
    }

    /// Load one lineage owned by `owner`.
    ///
    /// # Errors
    /// Returns [`LineageError::NotFound`] when no such lineage exists for this
    /// owner and [`LineageError::Corrupt`] when its ancestry cannot be decoded.
    pub fn get_lineage(&self, owner: &AccountId, id: LineageId) -> Result<Lineage> {
        load_lineage(&self.conn, owner, id)
    }

    /// Load every lineage owned by `owner`, most recently updated first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or any ancestry fails to decode.
    pub fn list_lineages(&self, owner: &AccountId) -> Result<Vec<Lineage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_LINEAGE_COLUMNS} FROM lineages
                 WHERE owner_id = ?1
                 ORDER BY updated_at_ns DESC, lineage_id DESC"
            ))
            .map_err(sql_error("failed to prepare lineage listing"))?;
        let rows = stmt
            .query_map(params![owner.as_str()], read_lineage_row)
            .map_err(sql_error("failed to list lineages"))?;

        let mut lineages = Vec::new();
        for row in rows {
            let row = row.map_err(sql_error("failed to read lineage row"))?;
            lineages.push(decode_row(row)?);
        }
        Ok(lineages)
    }

    /// Summaries of every lineage owned by `owner`, most recently updated first.
    /// Reads the stored ancestor count; ancestry blobs are never decoded.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_summaries(&self, owner: &AccountId) -> Result<Vec<LineageSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT lineage_id, current_json, ancestor_count, created_at_ns, updated_at_ns
                 FROM lineages
                 WHERE owner_id = ?1
                 ORDER BY updated_at_ns DESC, lineage_id DESC",
            )
            .map_err(sql_error("failed to prepare lineage summary listing"))?;
        let mut rows =
            stmt.query(params![owner.as_str()]).map_err(sql_error("failed to list summaries"))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().map_err(sql_error("failed to read summary row"))? {
            let lineage_id: String = row.get(0).map_err(sql_error("failed to read lineage_id"))?;
            let current_json: String =
                row.get(1).map_err(sql_error("failed to read current_json"))?;
            let ancestor_count: i64 =
                row.get(2).map_err(sql_error("failed to read ancestor_count"))?;
            let created_at_ns: i64 =
                row.get(3).map_err(sql_error("failed to read created_at_ns"))?;
            let updated_at_ns: i64 =
                row.get(4).map_err(sql_error("failed to read updated_at_ns"))?;

            summaries.push(LineageSummary {
                id: parse_lineage_id(&lineage_id)?,
                current: parse_genome(&current_json)?,
                ancestor_count: parse_ancestor_count(ancestor_count)?,
                created_at: from_unix_nanos(created_at_ns)?,
                updated_at: from_unix_nanos(updated_at_ns)?,
            });
        }
        Ok(summaries)
    }

    /// Remove one lineage owned by `owner`.
    ///
    /// # Errors
    /// Returns [`LineageError::NotFound`] when no such lineage exists for this owner.
    pub fn delete_lineage(&mut self, owner: &AccountId, id: LineageId) -> Result<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM lineages WHERE lineage_id = ?1 AND owner_id = ?2",
                params![id.to_string(), owner.as_str()],
            )
            .map_err(sql_error("failed to delete lineage"))?;
        if deleted == 0 {
            return Err(not_found(owner, id));
        }
        tracing::info!(lineage_id = %id, owner = %owner, "deleted lineage");
        Ok(())
    }

    /// Run a read-modify-write against one lineage inside a single write
    /// transaction. The closure sees the decoded lineage; whatever it leaves
    /// behind is encoded and saved before commit. If the closure fails, nothing
    /// is written.
    ///
    /// Concurrent callers on the same database serialize on the write lock;
    /// a caller that cannot obtain it within the busy timeout gets
    /// [`LineageError::Conflict`].
    ///
    /// # Errors
    /// Returns the closure's error, [`LineageError::NotFound`] for a missing
    /// lineage, or a codec/storage/conflict error from the transaction.
    pub fn update_lineage<T, F>(&mut self, owner: &AccountId, id: LineageId, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Lineage) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error("failed to start lineage update transaction"))?;

        let mut lineage = load_lineage(&tx, owner, id)?;
        let output = mutate(&mut lineage)?;
        if lineage.id != Some(id) || lineage.owner != *owner {
            return Err(LineageError::InvalidInput(
                "lineage id and owner MUST NOT change during an update".to_string(),
            ));
        }

        write_lineage(&tx, &mut lineage)?;
        tx.commit().map_err(sql_error("failed to commit lineage update transaction"))?;
        Ok(output)
    }

    /// Run quick-check, foreign-key-check, ancestry decoding, and schema status
    /// health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map_err(sql_error("failed to run PRAGMA quick_check"))?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .map_err(sql_error("failed to prepare PRAGMA foreign_key_check"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .map_err(sql_error("failed to run PRAGMA foreign_key_check"))?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.map_err(sql_error("failed to read fk violation"))?);
        }

        let corrupt_lineages = self.scan_corrupt_lineages()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            corrupt_lineages,
            schema_status,
        })
    }

    fn scan_corrupt_lineages(&self) -> Result<Vec<CorruptLineage>> {
        if !table_exists(&self.conn, "lineages")? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT lineage_id, owner_id, ancestry_blob, ancestor_count
                 FROM lineages
                 ORDER BY lineage_id ASC",
            )
            .map_err(sql_error("failed to prepare ancestry scan"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(sql_error("failed to scan ancestry blobs"))?;

        let mut corrupt = Vec::new();
        for row in rows {
            let (lineage_id, owner_id, blob, count) =
                row.map_err(sql_error("failed to read ancestry row"))?;
            let decoded = parse_ancestor_count(count).and_then(|count| decode_ancestry(&blob, count));
            if let Err(err) = decoded {
                tracing::error!(lineage_id = %lineage_id, owner = %owner_id, error = %err, "corrupt lineage record");
                corrupt.push(CorruptLineage { lineage_id, owner_id, reason: err.to_string() });
            }
        }
        Ok(corrupt)
    }
}

fn load_lineage(conn: &Connection, owner: &AccountId, id: LineageId) -> Result<Lineage> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SELECT_LINEAGE_COLUMNS} FROM lineages
                 WHERE lineage_id = ?1 AND owner_id = ?2"
            ),
            params![id.to_string(), owner.as_str()],
            read_lineage_row,
        )
        .optional()
        .map_err(sql_error("failed to read lineage"))?;

    match row {
        Some(row) => decode_row(row),
        None => Err(not_found(owner, id)),
    }
}

fn write_lineage(conn: &Connection, lineage: &mut Lineage) -> Result<LineageId> {
    let id = lineage.id.unwrap_or_default();
    let persisted = encode_lineage(lineage)?;
    let current_json = serde_json::to_string(&persisted.current)
        .map_err(|err| LineageError::Storage(format!("failed to encode current genome: {err}")))?;
    let ancestor_count = i64::try_from(persisted.ancestor_count)
        .map_err(|_| LineageError::Storage("ancestor_count overflows i64".to_string()))?;

    let written = conn
        .execute(
            "INSERT INTO lineages(
                lineage_id, owner_id, generator_seed, current_json,
                ancestry_blob, ancestor_count, created_at_ns, updated_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(lineage_id) DO UPDATE SET
                generator_seed = excluded.generator_seed,
                current_json = excluded.current_json,
                ancestry_blob = excluded.ancestry_blob,
                ancestor_count = excluded.ancestor_count,
                updated_at_ns = excluded.updated_at_ns
            WHERE lineages.owner_id = excluded.owner_id",
            params![
                id.to_string(),
                persisted.owner.as_str(),
                persisted.generator_seed,
                current_json,
                persisted.ancestry_blob,
                ancestor_count,
                to_unix_nanos(persisted.created_at)?,
                to_unix_nanos(persisted.updated_at)?,
            ],
        )
        .map_err(sql_error("failed to write lineage"))?;

    if written == 0 {
        return Err(not_found(&persisted.owner, id));
    }

    lineage.id = Some(id);
    Ok(id)
}

fn read_lineage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LineageRow> {
    Ok(LineageRow {
        lineage_id: row.get(0)?,
        owner_id: row.get(1)?,
        generator_seed: row.get(2)?,
        current_json: row.get(3)?,
        ancestry_blob: row.get(4)?,
        ancestor_count: row.get(5)?,
        created_at_ns: row.get(6)?,
        updated_at_ns: row.get(7)?,
    })
}

fn decode_row(row: LineageRow) -> Result<Lineage> {
    let lineage_id = row.lineage_id.clone();
    let decoded = persisted_from_row(row).and_then(decode_lineage);
    if let Err(LineageError::Corrupt(reason)) = &decoded {
        tracing::error!(lineage_id = %lineage_id, reason = %reason, "corrupt lineage record");
    }
    decoded
}

fn persisted_from_row(row: LineageRow) -> Result<PersistedLineage> {
    Ok(PersistedLineage {
        id: Some(parse_lineage_id(&row.lineage_id)?),
        owner: AccountId::new(row.owner_id),
        generator_seed: row.generator_seed,
        current: parse_genome(&row.current_json)?,
        ancestry_blob: row.ancestry_blob,
        ancestor_count: parse_ancestor_count(row.ancestor_count)?,
        created_at: from_unix_nanos(row.created_at_ns)?,
        updated_at: from_unix_nanos(row.updated_at_ns)?,
    })
}

fn sql_error(context: &str) -> impl FnOnce(rusqlite::Error) -> LineageError + '_ {
    move |err| match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            LineageError::Conflict(format!("{context}: {err}"))
        }
        _ => LineageError::Storage(format!("{context}: {err}")),
    }
}

fn not_found(owner: &AccountId, id: LineageId) -> LineageError {
    LineageError::NotFound(format!("lineage {id} not found for account {owner}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .map_err(sql_error(&format!("failed to check if table exists: {table_name}")))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(sql_error("failed to read current schema version"))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LineageError::Storage(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LineageError::Corrupt(format!("invalid RFC3339 timestamp {value}: {err}")))
}

fn to_unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .map_err(|_| LineageError::Storage(format!("timestamp out of storable range: {value}")))
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| LineageError::Corrupt(format!("invalid stored timestamp {value}: {err}")))
}

fn parse_lineage_id(raw: &str) -> Result<LineageId> {
    let parsed = Ulid::from_string(raw)
        .map_err(|err| LineageError::Corrupt(format!("invalid stored lineage id {raw}: {err}")))?;
    Ok(LineageId(parsed))
}

fn parse_genome(raw: &str) -> Result<Genome> {
    serde_json::from_str(raw)
        .map_err(|err| LineageError::Corrupt(format!("stored genome does not decode: {err}")))
}

fn parse_ancestor_count(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| LineageError::Corrupt(format!("negative ancestor_count {raw}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use serde_json::json;

    use super::*;

    fn unique_temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lineage-{prefix}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
        }
    }

    fn identity(external_id: &str) -> Identity {
        Identity {
            external_id: Some(external_id.to_string()),
            email: format!("{external_id}@example.com"),
        }
    }

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_is_idempotent_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn resolve_account_creates_once_and_falls_back_to_email() -> Result<()> {
        let mut store = migrated_memory_store()?;

        let first = store.resolve_account(&identity("alice"))?;
        let second = store.resolve_account(&identity("alice"))?;
        assert_eq!(first, second);
        assert_eq!(first.id, AccountId::new("alice"));
        assert_eq!(first.external_id.as_deref(), Some("alice"));

        let by_email = store.resolve_account(&Identity {
            external_id: None,
            email: "bob@example.com".to_string(),
        })?;
        assert_eq!(by_email.id, AccountId::new("bob@example.com"));
        assert_eq!(by_email.external_id, None);

        let anonymous = store.resolve_account(&Identity { external_id: None, email: " ".into() });
        assert!(matches!(anonymous, Err(LineageError::Unauthenticated(_))));
        Ok(())
    }

    #[test]
    fn create_and_get_round_trip() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;

        let created = store.create_lineage(&owner, Genome::new(json!({ "genes": [1, 2] })), Some(9))?;
        let id = created.id.unwrap_or_else(|| panic!("created lineage should carry an id"));
        assert_eq!(created.generator_seed, 9);
        assert!(created.ancestry.is_empty());

        let loaded = store.get_lineage(&owner, id)?;
        assert_eq!(loaded, created);
        Ok(())
    }

    #[test]
    fn float_genes_survive_storage_bit_for_bit() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;
        let weights = json!([1.544_182_742_674_156_1_f64, 1.576_268_145_870_115_3_f64]);

        let created = store.create_lineage(&owner, Genome::new(weights.clone()), Some(4))?;
        let id = created.id.unwrap_or_else(|| panic!("created lineage should carry an id"));
        store.update_lineage(&owner, id, |lineage| {
            lineage.ancestry.push(Genome::new(weights.clone()));
            Ok(())
        })?;

        let loaded = store.get_lineage(&owner, id)?;
        assert_eq!(loaded.current.as_value(), &weights);
        assert_eq!(loaded.ancestry, vec![Genome::new(weights.clone())]);
        assert_eq!(store.list_summaries(&owner)?[0].current.as_value(), &weights);
        Ok(())
    }

    #[test]
    fn unrepresentable_timestamp_is_a_storage_error() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;
        let far_future = OffsetDateTime::UNIX_EPOCH + time::Duration::days(365 * 400);
        let mut lineage = Lineage::new(owner.clone(), Genome::new(json!("g0")), Some(1), far_future)?;

        let result = store.save_lineage(&mut lineage);
        assert!(matches!(result, Err(LineageError::Storage(_))), "got {result:?}");
        assert_eq!(lineage.id, None);
        assert!(store.list_summaries(&owner)?.is_empty());
        Ok(())
    }

    #[test]
    fn lineages_are_invisible_across_accounts() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let alice = store.resolve_account(&identity("alice"))?.id;
        let mallory = store.resolve_account(&identity("mallory"))?.id;

        let mut lineage = store.create_lineage(&alice, Genome::new(json!("g0")), Some(1))?;
        let id = lineage.id.unwrap_or_else(|| panic!("created lineage should carry an id"));

        assert!(matches!(store.get_lineage(&mallory, id), Err(LineageError::NotFound(_))));
        assert!(store.list_lineages(&mallory)?.is_empty());
        assert!(store.list_summaries(&mallory)?.is_empty());
        assert!(matches!(store.delete_lineage(&mallory, id), Err(LineageError::NotFound(_))));
        let hijack = store.update_lineage(&mallory, id, |lineage| {
            lineage.generator_seed = 666;
            Ok(())
        });
        assert!(matches!(hijack, Err(LineageError::NotFound(_))));

        lineage.owner = mallory.clone();
        lineage.current = Genome::new(json!("stolen"));
        assert!(matches!(store.save_lineage(&mut lineage), Err(LineageError::NotFound(_))));

        let untouched = store.get_lineage(&alice, id)?;
        assert_eq!(untouched.current, Genome::new(json!("g0")));
        assert_eq!(untouched.generator_seed, 1);
        Ok(())
    }

    #[test]
    fn list_orders_by_most_recent_update_and_delete_removes_one() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;

        let first = store.create_lineage(&owner, Genome::new(json!("first")), Some(1))?;
        let second = store.create_lineage(&owner, Genome::new(json!("second")), Some(2))?;
        let first_id = first.id.unwrap_or_else(|| panic!("missing id"));
        let second_id = second.id.unwrap_or_else(|| panic!("missing id"));

        store.update_lineage(&owner, first_id, |lineage| {
            lineage.updated_at = second.updated_at + time::Duration::seconds(1);
            Ok(())
        })?;

        let ids = store
            .list_lineages(&owner)?
            .into_iter()
            .filter_map(|lineage| lineage.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![first_id, second_id]);

        store.delete_lineage(&owner, first_id)?;
        let remaining = store.list_summaries(&owner)?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second_id);
        assert!(matches!(store.delete_lineage(&owner, first_id), Err(LineageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn update_persists_codec_output_and_rolls_back_on_error() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;
        let lineage = store.create_lineage(&owner, Genome::new(json!("g0")), Some(5))?;
        let id = lineage.id.unwrap_or_else(|| panic!("missing id"));

        store.update_lineage(&owner, id, |lineage| {
            lineage.ancestry.push(lineage.current.clone());
            lineage.current = Genome::new(json!("g1"));
            Ok(())
        })?;

        let failed: Result<()> = store.update_lineage(&owner, id, |lineage| {
            lineage.ancestry.clear();
            lineage.generator_seed = 0;
            Err(LineageError::InvalidInput("abort".to_string()))
        });
        assert!(matches!(failed, Err(LineageError::InvalidInput(_))));

        let loaded = store.get_lineage(&owner, id)?;
        assert_eq!(loaded.ancestry, vec![Genome::new(json!("g0"))]);
        assert_eq!(loaded.current, Genome::new(json!("g1")));
        assert_eq!(loaded.generator_seed, 5);

        let summaries = store.list_summaries(&owner)?;
        assert_eq!(summaries[0].ancestor_count, 1);
        Ok(())
    }

    #[test]
    fn corrupt_ancestry_fails_load_and_is_reported() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;
        let lineage = store.create_lineage(&owner, Genome::new(json!("g0")), Some(5))?;
        let id = lineage.id.unwrap_or_else(|| panic!("missing id"));

        store
            .conn
            .execute(
                "UPDATE lineages SET ancestor_count = 3 WHERE lineage_id = ?1",
                params![id.to_string()],
            )
            .map_err(sql_error("fixture update failed"))?;

        assert!(matches!(store.get_lineage(&owner, id), Err(LineageError::Corrupt(_))));
        assert!(matches!(store.list_lineages(&owner), Err(LineageError::Corrupt(_))));
        let advanced = store.update_lineage(&owner, id, |lineage| {
            lineage.generator_seed += 1;
            Ok(())
        });
        assert!(matches!(advanced, Err(LineageError::Corrupt(_))));

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.corrupt_lineages.len(), 1);
        assert_eq!(report.corrupt_lineages[0].lineage_id, id.to_string());
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let owner = store.resolve_account(&identity("alice"))?.id;
        store.create_lineage(&owner, Genome::new(json!([1, 2, 3])), None)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.corrupt_lineages.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn held_write_lock_surfaces_as_conflict() -> Result<()> {
        let db_path = unique_temp_db_path("conflict");
        let mut holder = SqliteStore::open(&db_path)?;
        holder.migrate()?;
        let owner = holder.resolve_account(&identity("alice"))?.id;
        let lineage = holder.create_lineage(&owner, Genome::new(json!("g0")), Some(5))?;
        let id = lineage.id.unwrap_or_else(|| panic!("missing id"));

        let mut contender = SqliteStore::open_with_options(
            &db_path,
            StoreOptions { busy_timeout: Duration::from_millis(50) },
        )?;

        let tx = holder
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error("fixture lock failed"))?;
        let blocked = contender.update_lineage(&owner, id, |lineage| {
            lineage.generator_seed = 42;
            Ok(())
        });
        assert!(matches!(blocked, Err(LineageError::Conflict(_))), "got {blocked:?}");
        assert!(blocked.as_ref().err().is_some_and(LineageError::is_retryable));
        tx.rollback().map_err(sql_error("fixture rollback failed"))?;

        assert_eq!(contender.get_lineage(&owner, id)?.generator_seed, 5);
        drop(contender);
        drop(holder);
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn concurrent_updates_never_lose_increments() -> Result<()> {
        let db_path = unique_temp_db_path("concurrency");
        let (owner, id) = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            let owner = init.resolve_account(&identity("alice"))?.id;
            let lineage = init.create_lineage(&owner, Genome::new(json!("g0")), Some(1))?;
            (owner, lineage.id.unwrap_or_else(|| panic!("missing id")))
        };

        let writer_threads = 4;
        let updates_per_thread = 10;
        let mut handles = Vec::new();
        for _ in 0..writer_threads {
            let writer_path = db_path.clone();
            let owner = owner.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                for _ in 0..updates_per_thread {
                    store.update_lineage(&owner, id, |lineage| {
                        lineage.generator_seed += 1;
                        Ok(())
                    })?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(LineageError::Storage("concurrency thread panicked".to_string()));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let lineage = store.get_lineage(&owner, id)?;
        assert_eq!(lineage.generator_seed, 1 + writer_threads * updates_per_thread);
        drop(store);
        cleanup(&db_path);
        Ok(())
    }
}
