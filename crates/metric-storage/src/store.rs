//! Identity-keyed SQLite table of canonical metric records.
//!
//! Every column is TEXT so the store stays tolerant of the mixed
//! numeric/string provenance of harvested data; `post_id` is the primary
//! key and inserts are insert-or-ignore, never overwrites.

use std::collections::HashSet;
use std::path::Path;

use metric_core::{csv::encode_master_csv, MetricRecord, MASTER_SCHEMA};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MetricStore {
    pool: SqlitePool,
}

impl MetricStore {
    /// Open (creating if needed) the store file and ensure the schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, single connection so every caller sees the same table.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let columns = MASTER_SCHEMA
            .iter()
            .map(|col| format!("{col} TEXT"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS metrics ({columns}, PRIMARY KEY (post_id))");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Idempotent bulk insert. The batch is deduplicated by `post_id` (first
    /// occurrence wins) and records with an empty identity are dropped;
    /// identities already present in the table are silently skipped. Returns
    /// the number of rows actually inserted.
    pub async fn upsert(&self, records: &[MetricRecord]) -> Result<u64, StoreError> {
        let mut seen = HashSet::new();
        let batch: Vec<&MetricRecord> = records
            .iter()
            .filter(|r| !r.post_id.is_empty() && seen.insert(r.post_id.clone()))
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; MASTER_SCHEMA.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO metrics ({}) VALUES ({placeholders})",
            MASTER_SCHEMA.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in batch {
            let mut query = sqlx::query(&sql);
            for field in record.text_row() {
                query = query.bind(field);
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, total = records.len(), "metric store upsert");
        Ok(inserted)
    }

    /// Every stored record in storage (insertion) order.
    pub async fn export_all(&self) -> Result<Vec<MetricRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM metrics ORDER BY rowid",
            MASTER_SCHEMA.join(", ")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let fields: Vec<String> = (0..MASTER_SCHEMA.len())
                    .map(|idx| {
                        row.try_get::<Option<String>, _>(idx)
                            .ok()
                            .flatten()
                            .unwrap_or_default()
                    })
                    .collect();
                MetricRecord::from_text_row(&fields)
            })
            .collect())
    }

    /// The record with the most recent `timestamp_utc`. Records with an
    /// empty timestamp sort last; ties break toward the most recent insert.
    pub async fn latest(&self) -> Result<Option<MetricRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM metrics \
             ORDER BY \
               CASE WHEN timestamp_utc IS NULL OR timestamp_utc = '' THEN 1 ELSE 0 END, \
               timestamp_utc DESC, \
               rowid DESC \
             LIMIT 1",
            MASTER_SCHEMA.join(", ")
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| {
            let fields: Vec<String> = (0..MASTER_SCHEMA.len())
                .map(|idx| {
                    row.try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .unwrap_or_default()
                })
                .collect();
            MetricRecord::from_text_row(&fields)
        }))
    }

    /// Dump the whole table as a master-schema CSV file.
    pub async fn export_csv(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records = self.export_all().await?;
        tokio::fs::write(path, encode_master_csv(&records)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_core::ConversionStatus;

    fn record(post_id: &str, timestamp: &str) -> MetricRecord {
        MetricRecord {
            post_id: post_id.into(),
            timestamp_utc: timestamp.into(),
            platform: "Instagram".into(),
            media_type: "Reel".into(),
            engagement_score: 0.1,
            reach: 100.0,
            likes: 8.0,
            comments: 1.0,
            shares: 1.0,
            caption_text: "caption".into(),
            conversion_status: ConversionStatus::None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MetricStore::open_in_memory().await.unwrap();
        let batch = vec![record("metri_a", "2026-01-01"), record("metri_b", "2026-01-02")];

        assert_eq!(store.upsert(&batch).await.unwrap(), 2);
        assert_eq!(store.upsert(&batch).await.unwrap(), 0);
        assert_eq!(store.export_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upsert_dedups_within_batch_and_drops_empty_ids() {
        let store = MetricStore::open_in_memory().await.unwrap();
        let mut dup = record("metri_a", "2026-01-02");
        dup.platform = "TikTok".into();
        let batch = vec![record("metri_a", "2026-01-01"), dup, record("", "2026-01-03")];

        assert_eq!(store.upsert(&batch).await.unwrap(), 1);
        let stored = store.export_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        // First occurrence wins, no overwrite.
        assert_eq!(stored[0].platform, "Instagram");
    }

    #[tokio::test]
    async fn export_all_on_empty_store_is_empty() {
        let store = MetricStore::open_in_memory().await.unwrap();
        assert!(store.export_all().await.unwrap().is_empty());
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_prefers_timestamps_and_sorts_empty_last() {
        let store = MetricStore::open_in_memory().await.unwrap();
        store
            .upsert(&[
                record("metri_old", "2026-01-01T00:00:00+00:00"),
                record("metri_new", "2026-02-01T00:00:00+00:00"),
                record("metri_blank", ""),
            ])
            .await
            .unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.post_id, "metri_new");
    }

    #[tokio::test]
    async fn latest_breaks_ties_by_insertion_order() {
        let store = MetricStore::open_in_memory().await.unwrap();
        store.upsert(&[record("metri_a", "")]).await.unwrap();
        store.upsert(&[record("metri_b", "")]).await.unwrap();

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.post_id, "metri_b");
    }

    #[tokio::test]
    async fn records_round_trip_through_text_columns() {
        let store = MetricStore::open_in_memory().await.unwrap();
        let mut original = record("metri_rt", "2026-02-02T10:00:00+00:00");
        original.engagement_score = 0.0087;
        original.reach = 1500.0;
        original.conversion_status = ConversionStatus::Clicked;
        store.upsert(std::slice::from_ref(&original)).await.unwrap();

        let stored = store.export_all().await.unwrap();
        assert_eq!(stored, vec![original]);
    }

    #[tokio::test]
    async fn export_csv_writes_master_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data/open_metric.db");
        let store = MetricStore::open(&db_path).await.unwrap();
        store.upsert(&[record("metri_a", "2026-01-01")]).await.unwrap();

        let csv_path = dir.path().join("out/export.csv");
        store.export_csv(&csv_path).await.unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("post_id,timestamp_utc"));
        assert!(text.contains("metri_a"));
    }
}
