//! Database schema management for the PostgreSQL backend.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` when `DB_BACKEND=postgres`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `devices` registry, the `device_documents` table holding the
/// Data and Settings JSON documents, and `device_content` for messages, notes
/// and captures. Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id          TEXT        PRIMARY KEY,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One row per (device, "data" | "settings")
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_documents (
            device_id   TEXT  NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
            kind        TEXT  NOT NULL,
            body        JSONB NOT NULL DEFAULT '{}'::jsonb,
            PRIMARY KEY (device_id, kind)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_content (
            id          UUID        PRIMARY KEY,
            device_id   TEXT        NOT NULL REFERENCES devices (id) ON DELETE CASCADE,
            kind        TEXT        NOT NULL,
            date        TIMESTAMPTZ NOT NULL,
            body        JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Pagination and pruning both walk newest-first per collection
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_device_content_device_kind_date
            ON device_content (device_id, kind, date DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
