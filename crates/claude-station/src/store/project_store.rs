//! Project and document storage.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ProjectSettings;
use crate::store::schema::{Document, Project};
use crate::store::{parse_datetime, StoreError, StoreResult};

pub struct ProjectStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ProjectStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // ── Projects ───────────────────────────────────────

    pub fn create(&self, name: &str, default_model: &str, system_prompt: &str) -> StoreResult<Project> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let settings = ProjectSettings::default();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO projects (id, name, system_prompt, default_model, created_at, updated_at, settings_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                name,
                system_prompt,
                default_model,
                now.to_rfc3339(),
                now.to_rfc3339(),
                settings.to_json(),
            ],
        )?;
        info!("Created project '{}' ({})", name, &id[..8]);

        Ok(Project {
            id,
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            default_model: default_model.to_string(),
            created_at: now,
            updated_at: now,
            settings,
        })
    }

    pub fn get(&self, project_id: &str) -> StoreResult<Project> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, system_prompt, default_model, created_at, updated_at, settings_json
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query([project_id])?;
        match rows.next()? {
            Some(row) => row_to_project(row),
            None => Err(StoreError::NotFound { entity: "project", id: project_id.to_string() }),
        }
    }

    pub fn list(&self) -> StoreResult<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, system_prompt, default_model, created_at, updated_at, settings_json
             FROM projects ORDER BY updated_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(row_to_project(row)?);
        }
        Ok(projects)
    }

    pub fn update_name(&self, project_id: &str, name: &str) -> StoreResult<()> {
        self.touch_update(project_id, "name", name)
    }

    /// Changing the system prompt mutates Layer 1: the next turn pays a
    /// fresh cache write.
    pub fn update_system_prompt(&self, project_id: &str, system_prompt: &str) -> StoreResult<()> {
        self.touch_update(project_id, "system_prompt", system_prompt)
    }

    pub fn update_default_model(&self, project_id: &str, model_id: &str) -> StoreResult<()> {
        self.touch_update(project_id, "default_model", model_id)
    }

    pub fn update_settings(&self, project_id: &str, settings: &ProjectSettings) -> StoreResult<()> {
        let normalized = settings.clone().normalized();
        self.touch_update(project_id, "settings_json", &normalized.to_json())
    }

    fn touch_update(&self, project_id: &str, column: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let sql = format!("UPDATE projects SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let changed = conn.execute(&sql, params![value, Utc::now().to_rfc3339(), project_id])?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "project", id: project_id.to_string() });
        }
        info!("Updated project {} ({})", &project_id[..8.min(project_id.len())], column);
        Ok(())
    }

    /// Deletes the project; conversations, messages, and documents cascade.
    pub fn delete(&self, project_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM projects WHERE id = ?1", [project_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound { entity: "project", id: project_id.to_string() });
        }
        info!("Deleted project {}", &project_id[..8.min(project_id.len())]);
        Ok(())
    }

    // ── Documents ──────────────────────────────────────

    /// Register an uploaded document. Extraction already happened; the
    /// text stored here is immutable from now on.
    pub fn add_document(
        &self,
        project_id: &str,
        filename: &str,
        extracted_text: &str,
        token_count: i64,
        file_type: &str,
    ) -> StoreResult<Document> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents (id, project_id, filename, extracted_text, token_count, file_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, project_id, filename, extracted_text, token_count, file_type, now.to_rfc3339()],
        )?;
        conn.execute(
            "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), project_id],
        )?;
        info!("Indexed document '{}': {} tokens", filename, token_count);

        Ok(Document {
            id,
            project_id: project_id.to_string(),
            filename: filename.to_string(),
            extracted_text: extracted_text.to_string(),
            token_count,
            file_type: file_type.to_string(),
            created_at: now,
        })
    }

    pub fn remove_document(&self, document_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", [document_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound { entity: "document", id: document_id.to_string() });
        }
        info!("Removed document {}", &document_id[..8.min(document_id.len())]);
        Ok(())
    }

    /// Documents in upload order. This ordering feeds straight into the
    /// Layer-1 byte sequence; do not reorder.
    pub fn list_documents(&self, project_id: &str) -> StoreResult<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, filename, extracted_text, token_count, file_type, created_at
             FROM documents WHERE project_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let mut rows = stmt.query([project_id])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(row_to_document(row)?);
        }
        debug!("Loaded {} documents for project {}", documents.len(), project_id);
        Ok(documents)
    }

    pub fn total_document_tokens(&self, project_id: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(token_count), 0) FROM documents WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn row_to_project(row: &Row) -> StoreResult<Project> {
    let settings_json: String = row.get(6)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        default_model: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
        settings: ProjectSettings::from_json(&settings_json),
    })
}

fn row_to_document(row: &Row) -> StoreResult<Document> {
    Ok(Document {
        id: row.get(0)?,
        project_id: row.get(1)?,
        filename: row.get(2)?,
        extracted_text: row.get(3)?,
        token_count: row.get(4)?,
        file_type: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}
