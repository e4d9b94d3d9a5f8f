//! Watermarks persisted in the SQLite `checkpoints` table.
//!
//! Used by sources configured with `watermark = "checkpoint"`. The stream
//! key already identifies one origin, so filters are not consulted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use enrich_harness_core::models::{Filter, Watermark, WatermarkKind, WatermarkValue};
use enrich_harness_core::watermark::WatermarkTracker;

pub struct SqliteWatermarks {
    pool: SqlitePool,
}

fn kind_label(kind: WatermarkKind) -> &'static str {
    match kind {
        WatermarkKind::Date => "date",
        WatermarkKind::Offset => "offset",
    }
}

impl SqliteWatermarks {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_checkpoint(&self, stream: &str) -> Result<Option<(String, String)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT kind, cursor FROM checkpoints WHERE stream = ?")
                .bind(stream)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("reading checkpoint of '{}'", stream))?;
        Ok(row)
    }

    async fn set_checkpoint(&self, stream: &str, value: WatermarkValue) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (stream, kind, cursor, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(stream) DO UPDATE SET
                kind = excluded.kind,
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stream)
        .bind(kind_label(value.kind()))
        .bind(value.encode())
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing checkpoint of '{}'", stream))?;
        Ok(())
    }

    /// Forget a stream's position so the next feed is a full one.
    pub async fn reset(&self, stream: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE stream = ?")
            .bind(stream)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkTracker for SqliteWatermarks {
    async fn get(
        &self,
        stream_key: &str,
        kind: WatermarkKind,
        _filters: &[Filter],
    ) -> Result<Option<Watermark>> {
        let Some((stored_kind, cursor)) = self.get_checkpoint(stream_key).await? else {
            return Ok(None);
        };
        if stored_kind != kind_label(kind) {
            anyhow::bail!(
                "checkpoint of '{}' is a {} position, expected {}",
                stream_key,
                stored_kind,
                kind_label(kind)
            );
        }
        let value = WatermarkValue::decode(kind, &cursor).with_context(|| {
            format!("checkpoint of '{}' is unreadable: '{}'", stream_key, cursor)
        })?;
        Ok(Some(Watermark {
            stream_key: stream_key.to_string(),
            value,
        }))
    }

    async fn advance(&self, stream_key: &str, value: WatermarkValue) -> Result<()> {
        let current = self
            .get(stream_key, value.kind(), &[])
            .await?
            .map(|w| w.value);
        let next = match current {
            Some(current) => current.max(value),
            None => value,
        };
        if Some(next) != current {
            self.set_checkpoint(stream_key, next).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use enrich_harness_core::dates::parse_datetime;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn tracker() -> SqliteWatermarks {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        SqliteWatermarks::new(pool)
    }

    #[tokio::test]
    async fn test_empty_checkpoint_is_none() {
        let t = tracker().await;
        assert!(t.get("s", WatermarkKind::Date, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let t = tracker().await;
        let jan5 = WatermarkValue::Date(parse_datetime("2024-01-05").unwrap());
        let jan3 = WatermarkValue::Date(parse_datetime("2024-01-03").unwrap());
        t.advance("s", jan5).await.unwrap();
        t.advance("s", jan3).await.unwrap();
        let wm = t.get("s", WatermarkKind::Date, &[]).await.unwrap().unwrap();
        assert_eq!(wm.value, jan5);

        t.reset("s").await.unwrap();
        assert!(t.get("s", WatermarkKind::Date, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_an_error() {
        let t = tracker().await;
        t.advance("s", WatermarkValue::Offset(3)).await.unwrap();
        assert!(t.get("s", WatermarkKind::Date, &[]).await.is_err());
        let wm = t.get("s", WatermarkKind::Offset, &[]).await.unwrap().unwrap();
        assert_eq!(wm.value, WatermarkValue::Offset(3));
    }
}
