//! SQLite schema for the identity registry and feed checkpoints.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Feed positions per stream
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            stream TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unique identities (one person)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uidentities (
            uuid TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Identity tuples seen in a source, each bound to a unique identity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            uuid TEXT NOT NULL,
            source TEXT NOT NULL,
            name TEXT,
            email TEXT,
            username TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (uuid) REFERENCES uidentities(uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            uuid TEXT PRIMARY KEY,
            name TEXT,
            email TEXT,
            gender TEXT,
            gender_acc INTEGER,
            is_bot INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (uuid) REFERENCES uidentities(uuid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrollments (
            uuid TEXT NOT NULL,
            organization TEXT NOT NULL,
            start TEXT NOT NULL,
            "end" TEXT NOT NULL,
            UNIQUE(uuid, organization, start, "end"),
            FOREIGN KEY (uuid) REFERENCES uidentities(uuid),
            FOREIGN KEY (organization) REFERENCES organizations(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_uuid ON identities(uuid)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_enrollments_uuid ON enrollments(uuid)")
        .execute(pool)
        .await?;

    Ok(())
}
