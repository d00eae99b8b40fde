//! Durable state: projects, documents, conversations, messages, and the
//! rolling summaries the cache protocol depends on.
//!
//! SQLite behind an r2d2 pool. The database exclusively owns all
//! persistent rows; every other component works on value copies.

pub mod conversation_store;
pub mod migration;
pub mod project_store;
pub mod schema;

pub use conversation_store::{uncompressed_slice, ConversationStore, NewMessage};
pub use migration::{MigrationManager, SCHEMA_VERSION};
pub use project_store::ProjectStore;
pub use schema::{
    Attachment, Conversation, ConversationStats, Document, Message, Project, ProjectStats,
};

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use tracing::info;

/// Errors the store distinguishes for its callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compression tried to commit a cutoff that no longer advances the
    /// compressed boundary (raced with another summary update or a reset).
    #[error("compression cutoff is stale")]
    StaleCutoff,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("stored JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

/// The station database: one pool, two store facades.
pub struct StationDatabase {
    pub projects: ProjectStore,
    pub conversations: ConversationStore,
    pool: SqlitePool,
}

impl StationDatabase {
    /// Open (creating if needed) the database at `db_path` and run
    /// migrations.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        info!("Opening station database at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(8).build(manager)?;
        Self::from_pool(pool)
    }

    /// In-memory database for tests. A single pooled connection keeps all
    /// handles on the same memory store.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        let pool = Arc::new(pool);
        info!("Station database ready (schema v{})", SCHEMA_VERSION);
        Ok(Self {
            projects: ProjectStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            pool,
        })
    }
}

impl Drop for StationDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

pub(crate) fn parse_datetime(value: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| {
            tracing::warn!("Unparseable timestamp '{}', substituting now", value);
            chrono::Utc::now()
        })
}
