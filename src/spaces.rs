//! Knowledge spaces.
//!
//! A space groups documents. Its id is the local creation time formatted as
//! 14 digits (`YYYYMMDDHHMMSS`); when two spaces are created within the same
//! second the later one takes the next free second.

use chrono::{DateTime, Duration, Local};
use sqlx::SqlitePool;

use crate::error::{GatewayError, Result};
use crate::models::{KnowledgeSpace, SpaceId};

const MAX_ID_ATTEMPTS: i64 = 60;

#[derive(Clone)]
pub struct SpaceStore {
    pool: SqlitePool,
}

impl SpaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, description: &str) -> Result<KnowledgeSpace> {
        self.create_at(name, description, Local::now()).await
    }

    pub async fn create_at(
        &self,
        name: &str,
        description: &str,
        now: DateTime<Local>,
    ) -> Result<KnowledgeSpace> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::validation("space name must not be empty"));
        }

        for offset in 0..MAX_ID_ATTEMPTS {
            let at = now + Duration::seconds(offset);
            let space_id = SpaceId::new(at.format("%Y%m%d%H%M%S").to_string());
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO spaces (space_id, name, description, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(space_id.as_str())
            .bind(name)
            .bind(description)
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                tracing::info!(space_id = %space_id, name, "knowledge space created");
                return Ok(KnowledgeSpace {
                    space_id,
                    name: name.to_string(),
                    description: description.to_string(),
                    created_at: now.timestamp(),
                });
            }
        }

        Err(GatewayError::unknown("no free space id available"))
    }

    pub async fn get(&self, space_id: &SpaceId) -> Result<Option<KnowledgeSpace>> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT space_id, name, description, created_at FROM spaces WHERE space_id = ?",
        )
        .bind(space_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, description, created_at)| KnowledgeSpace {
            space_id: SpaceId::new(id),
            name,
            description,
            created_at,
        }))
    }

    /// Fails with `SpaceNotFound` unless the space exists.
    pub async fn require(&self, space_id: &SpaceId) -> Result<KnowledgeSpace> {
        self.get(space_id)
            .await?
            .ok_or_else(|| GatewayError::SpaceNotFound(space_id.to_string()))
    }
}
