//! Forward-only schema migrations.
//!
//! Version lives in the single-row `schema_meta` table. Each migration
//! runs inside its own transaction; re-running against a current database
//! is a no-op.

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{info, warn};

use crate::pricing::estimate_tokens;
use crate::store::schema;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// v2: rolling-summary columns on conversations plus the API call log
/// used for cache-hit-rate statistics.
const MIGRATION_V2_SQL: &str = "
ALTER TABLE conversations ADD COLUMN rolling_summary TEXT;
ALTER TABLE conversations ADD COLUMN last_compressed_msg_id TEXT;
ALTER TABLE conversations ADD COLUMN summary_token_count INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS api_call_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT,
    conversation_id TEXT,
    model_id TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_log_project ON api_call_log(project_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_api_log_conversation ON api_call_log(conversation_id, created_at DESC);
";

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Detect the schema version and bring the database up to date.
    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL)",
            [],
        )?;

        let current = self.current_version()?;
        info!("Database schema version: {}", current);

        if current > SCHEMA_VERSION {
            warn!(
                "Database schema {} is newer than this build ({}); leaving it alone",
                current, SCHEMA_VERSION
            );
            return Ok(());
        }

        for version in (current + 1)..=SCHEMA_VERSION {
            self.apply_migration(version)?;
        }

        Ok(())
    }

    pub fn current_version(&self) -> Result<i32> {
        self.conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
            .optional()
            .map(|v| v.unwrap_or(0))
    }

    fn apply_migration(&mut self, version: i32) -> Result<()> {
        info!("Applying migration {}...", version);
        let tx = self.conn.transaction()?;

        match version {
            1 => {
                tx.execute_batch(schema::SCHEMA_V1_SQL)?;
            }
            2 => {
                tx.execute_batch(MIGRATION_V2_SQL)?;
                backfill_summary_token_counts(&tx)?;
            }
            other => {
                warn!("No migration registered for version {}", other);
            }
        }

        let updated = tx.execute("UPDATE schema_meta SET version = ?1", [version])?;
        if updated == 0 {
            tx.execute("INSERT INTO schema_meta (version) VALUES (?1)", [version])?;
        }
        tx.commit()?;

        info!("Migration {} applied", version);
        Ok(())
    }
}

/// Tokenise any summaries that predate the `summary_token_count` column.
///
/// Pre-v2 installs can only have summaries from external tooling; the
/// triple invariant still has to hold once the column exists.
fn backfill_summary_token_counts(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, rolling_summary FROM conversations
         WHERE rolling_summary IS NOT NULL AND summary_token_count = 0",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>>>()?;

    for (id, summary) in rows {
        let tokens = estimate_tokens(&summary) as i64;
        conn.execute(
            "UPDATE conversations SET summary_token_count = ?1 WHERE id = ?2",
            rusqlite::params![tokens, id],
        )?;
    }
    Ok(())
}
