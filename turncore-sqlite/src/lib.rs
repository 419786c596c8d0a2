//! SQLite repository for `turncore`
//!
//! Entities live in a single `entities` table keyed by id, with the
//! document stored as JSON text and an integer version column. Every write
//! is a conditional statement on that version, so two processes sharing a
//! database file get the same optimistic concurrency guarantees as two
//! tasks sharing one process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{query, Pool, QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use turncore::entity::Entity;
use turncore::errors::{RepositoryError, RepositoryResult};
use turncore::repository::{PersistedRecord, Repository, WriteBatch, WriteOp};
use turncore::types::{EntityId, EntityKind, EntityVersion};

/// Most ids bound into one `IN (...)` list.
///
/// Stays well below SQLite's host parameter limit.
pub const LOAD_BULK_CHUNK: usize = 500;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entities (
    entity_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    data TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT
)";

const CREATE_KIND_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_entity_type ON entities (entity_type)";

/// Failures opening a database.
#[derive(Debug, Error)]
pub enum SqliteRepositoryError {
    /// The pool could not be created.
    #[error("failed to open sqlite database")]
    ConnectionFailed(#[source] sqlx::Error),
    /// The schema could not be created.
    #[error("failed to create sqlite schema")]
    MigrationFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 5,
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Into, Default)
)]
pub struct MaxConnections(u32);

/// Where the database lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SqliteLocation {
    /// A private in-memory database, gone when the repository is dropped.
    #[default]
    InMemory,
    /// A database file, created when missing.
    File(PathBuf),
}

/// Configuration for the repository's connection pool.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database location (default: in memory)
    pub location: SqliteLocation,
    /// Maximum number of connections for file databases (default: 5)
    pub max_connections: MaxConnections,
    /// How long a statement waits on a locked database (default: 5 seconds)
    pub busy_timeout: Duration,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            location: SqliteLocation::InMemory,
            max_connections: MaxConnections::default(),
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl SqliteConfig {
    /// A file-backed configuration with default pool settings.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SqliteLocation::File(path.into()),
            ..Self::default()
        }
    }
}

/// Database step that failed, reported in `StoreFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Save,
    Load,
    LoadBulk,
    Delete,
    Exists,
    ListByKind,
    Count,
    Clear,
    BeginTransaction,
    CommitTransaction,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Save => "save",
            Self::Load => "load",
            Self::LoadBulk => "load_bulk",
            Self::Delete => "delete",
            Self::Exists => "exists",
            Self::ListByKind => "list_by_kind",
            Self::Count => "count",
            Self::Clear => "clear",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
        };
        f.write_str(name)
    }
}

/// Repository backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    /// A fresh in-memory database with the schema created.
    pub async fn in_memory() -> Result<Self, SqliteRepositoryError> {
        Self::open(SqliteConfig::default()).await
    }

    /// Opens the configured database and creates the schema if needed.
    pub async fn open(config: SqliteConfig) -> Result<Self, SqliteRepositoryError> {
        let pool = match &config.location {
            SqliteLocation::InMemory => {
                // Every connection to :memory: is its own database, so the
                // pool keeps exactly one alive for the repository's lifetime.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(SqliteRepositoryError::ConnectionFailed)?
                    .busy_timeout(config.busy_timeout);
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .acquire_timeout(config.acquire_timeout)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
            }
            SqliteLocation::File(path) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(config.busy_timeout);
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections.into_inner())
                    .acquire_timeout(config.acquire_timeout)
                    .connect_with(options)
                    .await
            }
        }
        .map_err(SqliteRepositoryError::ConnectionFailed)?;

        let repository = Self { pool };
        repository.migrate().await?;
        info!(location = ?config.location, "[sqlite.open] repository ready");
        Ok(repository)
    }

    /// Wraps an existing pool. Call [`SqliteRepository::migrate`] before use
    /// unless the schema already exists.
    pub const fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Creates the table and index if they do not exist.
    pub async fn migrate(&self) -> Result<(), SqliteRepositoryError> {
        for statement in [CREATE_TABLE, CREATE_KIND_INDEX] {
            query(statement)
                .execute(&self.pool)
                .await
                .map_err(SqliteRepositoryError::MigrationFailed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    #[instrument(name = "sqlite.save", skip_all, fields(entity = %id))]
    async fn save(&self, id: &EntityId, record: &PersistedRecord) -> RepositoryResult<EntityVersion> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Save))?;
        save_on(&mut *conn, id, &record.entity, record.version).await
    }

    #[instrument(name = "sqlite.load", skip_all, fields(entity = %id))]
    async fn load(&self, id: &EntityId) -> RepositoryResult<Option<PersistedRecord>> {
        let row = query("SELECT entity_id, data, version FROM entities WHERE entity_id = ?")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Load))?;

        row.map(|row| decode_row(&row).map(|(_, record)| record))
            .transpose()
    }

    #[instrument(name = "sqlite.load_bulk", skip(self, ids), fields(requested = ids.len()))]
    async fn load_bulk(&self, ids: &[EntityId]) -> RepositoryResult<HashMap<EntityId, PersistedRecord>> {
        let unique: Vec<&EntityId> = ids.iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut loaded = HashMap::with_capacity(unique.len());

        for chunk in unique.chunks(LOAD_BULK_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("SELECT entity_id, data, version FROM entities WHERE entity_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_ref().to_string());
            }
            separated.push_unseparated(")");

            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::LoadBulk))?;
            for row in &rows {
                let (id, record) = decode_row(row)?;
                loaded.insert(id, record);
            }
        }

        debug!(found = loaded.len(), "[sqlite.load_bulk] entities loaded");
        Ok(loaded)
    }

    #[instrument(name = "sqlite.delete", skip_all, fields(entity = %id))]
    async fn delete(&self, id: &EntityId) -> RepositoryResult<bool> {
        let result = query("DELETE FROM entities WHERE entity_id = ?")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Delete))?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, id: &EntityId) -> RepositoryResult<bool> {
        let row = query("SELECT 1 FROM entities WHERE entity_id = ?")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Exists))?;
        Ok(row.is_some())
    }

    #[instrument(name = "sqlite.list_by_kind", skip_all, fields(kind = %kind))]
    async fn list_by_kind(&self, kind: &EntityKind) -> RepositoryResult<Vec<(EntityId, PersistedRecord)>> {
        let rows = query(
            "SELECT entity_id, data, version FROM entities WHERE entity_type = ? ORDER BY entity_id",
        )
        .bind(kind.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ListByKind))?;

        rows.iter().map(decode_row).collect()
    }

    async fn count(&self) -> RepositoryResult<usize> {
        let count: i64 = query("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(|error| map_sqlx_error(error, Operation::Count))?;
        usize::try_from(count).map_err(|error| RepositoryError::store_failure("count", error))
    }

    async fn clear(&self) -> RepositoryResult<()> {
        query("DELETE FROM entities")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Clear))?;
        Ok(())
    }

    #[instrument(name = "sqlite.commit_batch", skip(self, batch), fields(ops = batch.len()))]
    async fn commit_batch(&self, batch: WriteBatch) -> RepositoryResult<HashMap<EntityId, EntityVersion>> {
        if batch.is_empty() {
            return Ok(HashMap::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // Dropping `tx` on an early return rolls the whole batch back
        let mut new_versions = HashMap::new();
        for op in batch.into_ops() {
            match op {
                WriteOp::Save { id, entity, expected } => {
                    let version = save_on(&mut *tx, &id, &entity, expected).await?;
                    new_versions.insert(id, version);
                }
                WriteOp::Delete { id, expected } => {
                    delete_on(&mut *tx, &id, expected).await?;
                    new_versions.remove(&id);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(written = new_versions.len(), "[sqlite.commit_batch] batch committed");
        Ok(new_versions)
    }
}

async fn save_on(
    conn: &mut SqliteConnection,
    id: &EntityId,
    entity: &Entity,
    expected: EntityVersion,
) -> RepositoryResult<EntityVersion> {
    let data = serde_json::to_string(entity).map_err(|error| RepositoryError::Serialization {
        id: id.clone(),
        detail: error.to_string(),
    })?;
    let version = expected.next();
    let updated_at = chrono::Utc::now().to_rfc3339();

    let result = if expected.is_initial() {
        query(
            "INSERT INTO entities (entity_id, entity_type, data, version, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (entity_id) DO NOTHING",
        )
        .bind(id.as_ref())
        .bind(entity.kind().as_ref())
        .bind(data.as_str())
        .bind(to_sql_version(id, version)?)
        .bind(updated_at.as_str())
        .execute(&mut *conn)
        .await
    } else {
        query(
            "UPDATE entities SET entity_type = ?, data = ?, version = ?, updated_at = ?
             WHERE entity_id = ? AND version = ?",
        )
        .bind(entity.kind().as_ref())
        .bind(data.as_str())
        .bind(to_sql_version(id, version)?)
        .bind(updated_at.as_str())
        .bind(id.as_ref())
        .bind(to_sql_version(id, expected)?)
        .execute(&mut *conn)
        .await
    }
    .map_err(|error| map_sqlx_error(error, Operation::Save))?;

    if result.rows_affected() == 0 {
        let current = current_version(conn, id).await?;
        return Err(conflict(id, expected, current));
    }
    Ok(version)
}

async fn delete_on(
    conn: &mut SqliteConnection,
    id: &EntityId,
    expected: Option<EntityVersion>,
) -> RepositoryResult<()> {
    let Some(expected) = expected else {
        query("DELETE FROM entities WHERE entity_id = ?")
            .bind(id.as_ref())
            .execute(&mut *conn)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Delete))?;
        return Ok(());
    };

    let result = query("DELETE FROM entities WHERE entity_id = ? AND version = ?")
        .bind(id.as_ref())
        .bind(to_sql_version(id, expected)?)
        .execute(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Delete))?;

    if result.rows_affected() == 0 {
        // Deleting an absent record at its implicit version 0 is a no-op
        let current = current_version(conn, id).await?;
        if current != expected {
            return Err(conflict(id, expected, current));
        }
    }
    Ok(())
}

async fn current_version(conn: &mut SqliteConnection, id: &EntityId) -> RepositoryResult<EntityVersion> {
    let stored: Option<i64> = query("SELECT version FROM entities WHERE entity_id = ?")
        .bind(id.as_ref())
        .fetch_optional(&mut *conn)
        .await
        .and_then(|row| row.map(|row| row.try_get(0)).transpose())
        .map_err(|error| map_sqlx_error(error, Operation::Load))?;
    stored.map_or_else(|| Ok(EntityVersion::initial()), |version| from_sql_version(id, version))
}

fn conflict(id: &EntityId, expected: EntityVersion, current: EntityVersion) -> RepositoryError {
    warn!(
        entity = %id,
        expected = %expected,
        current = %current,
        "[sqlite.version_conflict] optimistic concurrency check failed"
    );
    RepositoryError::VersionConflict {
        id: id.clone(),
        expected,
        current,
    }
}

fn decode_row(row: &SqliteRow) -> RepositoryResult<(EntityId, PersistedRecord)> {
    let raw_id: String = row
        .try_get("entity_id")
        .map_err(|error| map_sqlx_error(error, Operation::Load))?;
    let id = EntityId::try_new(raw_id.clone()).map_err(|error| {
        RepositoryError::store_failure("decode", format!("invalid entity id '{raw_id}': {error}"))
    })?;

    let data: String = row
        .try_get("data")
        .map_err(|error| map_sqlx_error(error, Operation::Load))?;
    let entity: Entity =
        serde_json::from_str(&data).map_err(|error| RepositoryError::Deserialization {
            id: id.clone(),
            detail: error.to_string(),
        })?;

    let version: i64 = row
        .try_get("version")
        .map_err(|error| map_sqlx_error(error, Operation::Load))?;
    let version = from_sql_version(&id, version)?;

    Ok((id, PersistedRecord::new(entity, version)))
}

fn to_sql_version(id: &EntityId, version: EntityVersion) -> RepositoryResult<i64> {
    i64::try_from(version.into_inner()).map_err(|_| RepositoryError::Serialization {
        id: id.clone(),
        detail: format!("version {version} does not fit in an INTEGER column"),
    })
}

fn from_sql_version(id: &EntityId, version: i64) -> RepositoryResult<EntityVersion> {
    u64::try_from(version)
        .map(EntityVersion::new)
        .map_err(|_| RepositoryError::Deserialization {
            id: id.clone(),
            detail: format!("negative version {version}"),
        })
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> RepositoryError {
    error!(
        error = %error,
        operation = %operation,
        "[sqlite.database_error] database operation failed"
    );
    RepositoryError::store_failure(operation.to_string(), error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::try_new(s).unwrap()
    }

    fn player(gold: i64) -> Entity {
        Entity::new(EntityKind::try_new("player").unwrap()).with("gold", gold)
    }

    fn v(n: u64) -> EntityVersion {
        EntityVersion::new(n)
    }

    async fn repo() -> SqliteRepository {
        SqliteRepository::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let repo = repo().await;
        repo.migrate().await.unwrap();
        repo.migrate().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_update_and_conflict() {
        let repo = repo().await;

        assert_eq!(repo.save(&id("p1"), &PersistedRecord::fresh(player(100))).await, Ok(v(1)));
        assert_eq!(repo.save(&id("p1"), &PersistedRecord::new(player(150), v(1))).await, Ok(v(2)));

        let stale = repo.save(&id("p1"), &PersistedRecord::new(player(80), v(1))).await;
        assert_eq!(
            stale,
            Err(RepositoryError::VersionConflict {
                id: id("p1"),
                expected: v(1),
                current: v(2),
            })
        );

        let duplicate = repo.save(&id("p1"), &PersistedRecord::fresh(player(0))).await;
        assert!(duplicate.unwrap_err().is_version_conflict());

        let stored = repo.load(&id("p1")).await.unwrap().unwrap();
        assert_eq!(stored.version, v(2));
        assert_eq!(stored.entity, player(150));
    }

    #[tokio::test]
    async fn updating_a_missing_record_conflicts_at_version_zero() {
        let repo = repo().await;
        let result = repo.save(&id("ghost"), &PersistedRecord::new(player(1), v(3))).await;
        assert_eq!(
            result,
            Err(RepositoryError::VersionConflict {
                id: id("ghost"),
                expected: v(3),
                current: v(0),
            })
        );
    }

    #[tokio::test]
    async fn load_bulk_spans_several_chunks() {
        let repo = repo().await;
        let mut batch = WriteBatch::new();
        for n in 0..1_200 {
            batch.save(id(&format!("e{n:05}")), player(n), v(0));
        }
        repo.commit_batch(batch).await.unwrap();

        let mut wanted: Vec<EntityId> = (0..1_300).map(|n| id(&format!("e{n:05}"))).collect();
        wanted.push(id("e00001"));
        let loaded = repo.load_bulk(&wanted).await.unwrap();

        assert_eq!(loaded.len(), 1_200);
        assert_eq!(loaded[&id("e00777")].entity.get_i64("gold"), Some(777));
        assert!(repo.load_bulk(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_batch_is_rolled_back() {
        let repo = repo().await;
        repo.save(&id("a"), &PersistedRecord::fresh(player(1))).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .save(id("b"), player(2), v(0))
            .save(id("a"), player(3), v(9));
        assert!(repo.commit_batch(batch).await.unwrap_err().is_version_conflict());

        assert!(!repo.exists(&id("b")).await.unwrap());
        assert_eq!(repo.load(&id("a")).await.unwrap().unwrap().version, v(1));
    }

    #[tokio::test]
    async fn conditional_delete_checks_the_version() {
        let repo = repo().await;
        repo.save(&id("a"), &PersistedRecord::fresh(player(1))).await.unwrap();

        let mut stale = WriteBatch::new();
        stale.delete(id("a"), Some(v(5)));
        assert!(repo.commit_batch(stale).await.unwrap_err().is_version_conflict());

        let mut current = WriteBatch::new();
        current.delete(id("a"), Some(v(1))).delete(id("never"), Some(v(0)));
        repo.commit_batch(current).await.unwrap();
        assert!(!repo.exists(&id("a")).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_kind_uses_the_discriminator() {
        let repo = repo().await;
        let mob = Entity::new(EntityKind::try_new("mob").unwrap()).with("hp", 30);
        repo.save(&id("p2"), &PersistedRecord::fresh(player(1))).await.unwrap();
        repo.save(&id("m1"), &PersistedRecord::fresh(mob)).await.unwrap();
        repo.save(&id("p1"), &PersistedRecord::fresh(player(1))).await.unwrap();

        let players = repo.list_by_kind(&EntityKind::try_new("player").unwrap()).await.unwrap();
        let ids: Vec<EntityId> = players.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![id("p1"), id("p2")]);
    }

    #[tokio::test]
    async fn delete_count_and_clear() {
        let repo = repo().await;
        repo.save(&id("a"), &PersistedRecord::fresh(player(1))).await.unwrap();
        repo.save(&id("b"), &PersistedRecord::fresh(player(1))).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 2);

        assert!(repo.delete(&id("a")).await.unwrap());
        assert!(!repo.delete(&id("a")).await.unwrap());

        repo.clear().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_database_survives_reopening() {
        let path = std::env::temp_dir().join(format!("turncore-{}.db", uuid::Uuid::now_v7()));

        {
            let repo = SqliteRepository::open(SqliteConfig::file(&path)).await.unwrap();
            repo.save(&id("p1"), &PersistedRecord::fresh(player(42))).await.unwrap();
            repo.pool().close().await;
        }

        let reopened = SqliteRepository::open(SqliteConfig::file(&path)).await.unwrap();
        let stored = reopened.load(&id("p1")).await.unwrap().unwrap();
        assert_eq!(stored.entity.get_i64("gold"), Some(42));
        assert_eq!(stored.version, v(1));
        reopened.pool().close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }
}
