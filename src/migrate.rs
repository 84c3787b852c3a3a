use sqlx::SqlitePool;

use crate::error::Result;

/// Create the gateway schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Knowledge spaces
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spaces (
            space_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Remote document id -> space, display name and object key parts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_map (
            document_id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            extension TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_map_space_id ON file_map(space_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_map_space_name ON file_map(space_id, file_name)",
    )
    .execute(pool)
    .await?;

    tracing::debug!("schema up to date");
    Ok(())
}
