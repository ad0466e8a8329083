//! PostgreSQL backend: documents and content bodies are stored as JSONB.
//!
//! Tables are created by [`crate::schema::create_schema`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{next_cursor, ContentBackend, DocumentKind, DocumentStore, RepoResult};
use crate::models::{ContentKind, Entry, Page, Paginated};

// ---

pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    id: Uuid,
    date: DateTime<Utc>,
    body: Value,
}

impl From<ContentRow> for Entry<Value> {
    fn from(row: ContentRow) -> Self {
        Entry {
            id: row.id.to_string(),
            date: row.date,
            body: row.body,
        }
    }
}

/// Content ids are UUIDs; anything else cannot match a row.
fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

#[async_trait]
impl DocumentStore for PgBackend {
    async fn device_exists(&self, device_id: &str) -> RepoResult<bool> {
        // ---
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM devices WHERE id = $1)")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn register_device(&self, device_id: &str) -> RepoResult<()> {
        // ---
        sqlx::query("INSERT INTO devices (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, device_id: &str, kind: DocumentKind) -> RepoResult<Option<Value>> {
        // ---
        let body: Option<Value> = sqlx::query_scalar(
            "SELECT body FROM device_documents WHERE device_id = $1 AND kind = $2",
        )
        .bind(device_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(body)
    }

    async fn update(&self, device_id: &str, kind: DocumentKind, patch: Value) -> RepoResult<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO device_documents (device_id, kind, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (device_id, kind) DO UPDATE
                SET body = device_documents.body || EXCLUDED.body
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(patch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContentBackend for PgBackend {
    async fn list(
        &self,
        device_id: &str,
        kind: ContentKind,
        page: Page,
    ) -> RepoResult<Paginated<Value>> {
        // ---
        let rows: Vec<ContentRow> = sqlx::query_as(
            r#"
            SELECT id, date, body
              FROM device_content
             WHERE device_id = $1
               AND kind = $2
               AND ($3::timestamptz IS NULL OR date < $3)
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(page.start_after)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<Entry<Value>> = rows.into_iter().map(Entry::from).collect();
        let next_start_after = next_cursor(&entries, page.limit);
        Ok(Paginated {
            entries,
            next_start_after,
        })
    }

    async fn add(
        &self,
        device_id: &str,
        kind: ContentKind,
        body: Value,
        prune_to: Option<usize>,
    ) -> RepoResult<Entry<Value>> {
        // ---
        let mut tx = self.pool.begin().await?;

        let row: ContentRow = sqlx::query_as(
            r#"
            INSERT INTO device_content (id, device_id, kind, date, body)
            VALUES ($1, $2, $3, clock_timestamp(), $4)
            RETURNING id, date, body
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(device_id)
        .bind(kind.as_str())
        .bind(body)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(cap) = prune_to {
            sqlx::query(
                r#"
                DELETE FROM device_content
                 WHERE id IN (
                    SELECT id FROM device_content
                     WHERE device_id = $1 AND kind = $2
                     ORDER BY date DESC
                     OFFSET $3
                 )
                "#,
            )
            .bind(device_id)
            .bind(kind.as_str())
            .bind(cap as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn update(
        &self,
        device_id: &str,
        kind: ContentKind,
        id: &str,
        patch: Value,
    ) -> RepoResult<Option<Entry<Value>>> {
        // ---
        let Some(id) = parse_id(id) else {
            return Ok(None);
        };

        let row: Option<ContentRow> = sqlx::query_as(
            r#"
            UPDATE device_content
               SET body = body || $4
             WHERE device_id = $1 AND kind = $2 AND id = $3
            RETURNING id, date, body
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(id)
        .bind(patch)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Entry::from))
    }

    async fn remove(&self, device_id: &str, kind: ContentKind, id: &str) -> RepoResult<()> {
        // ---
        let Some(id) = parse_id(id) else {
            return Ok(());
        };

        sqlx::query("DELETE FROM device_content WHERE device_id = $1 AND kind = $2 AND id = $3")
            .bind(device_id)
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self, device_id: &str, kind: ContentKind) -> RepoResult<()> {
        // ---
        sqlx::query("DELETE FROM device_content WHERE device_id = $1 AND kind = $2")
            .bind(device_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
