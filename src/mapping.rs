//! Document mapping store (`file_map`).
//!
//! Maps a remote document id to its space, display name and extension. The
//! object-store key of a document is `file_name + extension`, so this table
//! is the only place the key can be recovered from once the upload is gone.
//!
//! Each mutation is a single statement; SQLite's writer lock serializes
//! concurrent writes to the same row.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{DocumentId, DocumentMapping, SpaceId};

type MappingRow = (String, String, String, String, i64, i64);

const COLUMNS: &str = "document_id, space_id, file_name, extension, created_at, updated_at";

fn from_row(row: MappingRow) -> DocumentMapping {
    let (document_id, space_id, file_name, extension, created_at, updated_at) = row;
    DocumentMapping {
        document_id: DocumentId::new(document_id),
        space_id: SpaceId::new(space_id),
        file_name,
        extension,
        created_at,
        updated_at,
    }
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'` pattern.
pub fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Clone)]
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, mapping: &DocumentMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_map (document_id, space_id, file_name, extension, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mapping.document_id.as_str())
        .bind(mapping.space_id.as_str())
        .bind(&mapping.file_name)
        .bind(&mapping.extension)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, document_id: &DocumentId) -> Result<Option<DocumentMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM file_map WHERE document_id = ?",
            COLUMNS
        ))
        .bind(document_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(from_row))
    }

    /// Documents of a space, oldest first.
    pub async fn find_by_space(
        &self,
        space_id: &SpaceId,
        limit: Option<i64>,
    ) -> Result<Vec<DocumentMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM file_map WHERE space_id = ? ORDER BY created_at ASC, document_id ASC LIMIT ?",
            COLUMNS
        ))
        .bind(space_id.as_str())
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    /// Substring match on `file_name` within a space. A blank query matches everything.
    pub async fn search_by_name(
        &self,
        space_id: &SpaceId,
        query: &str,
    ) -> Result<Vec<DocumentMapping>> {
        let query = query.trim();
        if query.is_empty() {
            return self.find_by_space(space_id, None).await;
        }

        let pattern = format!("%{}%", escape_like(query));
        let rows: Vec<MappingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM file_map WHERE space_id = ? AND file_name LIKE ? ESCAPE '\\' ORDER BY created_at ASC, document_id ASC",
            COLUMNS
        ))
        .bind(space_id.as_str())
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    /// Rewrite the display name and extension of an existing row.
    pub async fn update(
        &self,
        document_id: &DocumentId,
        file_name: &str,
        extension: &str,
        updated_at: i64,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE file_map SET file_name = ?, extension = ?, updated_at = ? WHERE document_id = ?",
        )
        .bind(file_name)
        .bind(extension)
        .bind(updated_at)
        .bind(document_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Returns whether a row was removed.
    pub async fn delete_by_id(&self, document_id: &DocumentId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM file_map WHERE document_id = ?")
            .bind(document_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }
}
