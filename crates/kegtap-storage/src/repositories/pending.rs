#![allow(async_fn_in_trait)]

use crate::error::StorageResult;
use crate::models::{PendingRecord, PendingRow};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

/// FIFO access to the durable outbound queue.
///
/// Every operation is a single statement; callers never hold a transaction
/// across a backend call.
pub trait PendingRecordRepository: Send + Sync {
    /// Append a record. Returns the new row id.
    async fn enqueue(&self, record: &PendingRecord) -> StorageResult<i64>;

    /// Oldest row by insertion order.
    async fn oldest(&self) -> StorageResult<Option<PendingRow>>;

    /// Up to `limit` rows, oldest first.
    async fn list(&self, limit: i64) -> StorageResult<Vec<PendingRow>>;

    /// Delete one row. Returns whether it existed.
    async fn delete(&self, id: i64) -> StorageResult<bool>;

    async fn count(&self) -> StorageResult<i64>;
}

/// SQLite implementation of [`PendingRecordRepository`].
#[derive(Debug, Clone)]
pub struct SqlitePendingRecordRepository {
    pool: SqlitePool,
}

impl SqlitePendingRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl PendingRecordRepository for SqlitePendingRecordRepository {
    async fn enqueue(&self, record: &PendingRecord) -> StorageResult<i64> {
        let payload = record.to_payload()?;
        let result = sqlx::query(
            r#"
            INSERT INTO pending_records (record_type, payload, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(record.record_type())
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, record_type = record.record_type(), "Queued record");
        Ok(id)
    }

    async fn oldest(&self) -> StorageResult<Option<PendingRow>> {
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT id, record_type, payload, created_at
            FROM pending_records
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list(&self, limit: i64) -> StorageResult<Vec<PendingRow>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT id, record_type, payload, created_at
            FROM pending_records
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn delete(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM pending_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_records")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Database;
    use kegtap_core::backend::{RecordDrinkRequest, RecordTemperatureRequest};

    fn pour(tap: &str, volume_ml: f64) -> PendingRecord {
        PendingRecord::Pour(RecordDrinkRequest {
            tap: tap.to_string(),
            volume_ml,
            ticks: 100,
            shout: String::new(),
            username: "alice".to_string(),
            record_date: Utc::now(),
            duration_ms: 1500,
            tick_time_series: Vec::new(),
            picture: None,
        })
    }

    async fn repository() -> SqlitePendingRecordRepository {
        let db = Database::in_memory().await.unwrap();
        SqlitePendingRecordRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_oldest_first() {
        let repo = repository().await;
        let first = repo.enqueue(&pour("kegboard.flow0", 330.0)).await.unwrap();
        let second = repo.enqueue(&pour("kegboard.flow1", 500.0)).await.unwrap();
        assert!(second > first);

        let oldest = repo.oldest().await.unwrap().unwrap();
        assert_eq!(oldest.id, first);
        assert_eq!(oldest.record_type, "pour");
        match oldest.decode().unwrap() {
            PendingRecord::Pour(request) => {
                assert_eq!(request.tap, "kegboard.flow0");
                assert_eq!(request.volume_ml, 330.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(repo.delete(first).await.unwrap());
        assert!(!repo.delete(first).await.unwrap());
        assert_eq!(repo.oldest().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn test_count_and_list() {
        let repo = repository().await;
        assert_eq!(repo.count().await.unwrap(), 0);
        assert!(repo.oldest().await.unwrap().is_none());

        repo.enqueue(&pour("kegboard.flow0", 330.0)).await.unwrap();
        repo.enqueue(&PendingRecord::Thermo(RecordTemperatureRequest {
            sensor_name: "kegboard.thermo-0".into(),
            temperature_c: 4.0,
            record_date: Utc::now(),
        }))
        .await
        .unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        let types: Vec<String> = repo
            .list(10)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.record_type)
            .collect();
        assert_eq!(types, vec!["pour", "thermo"]);
        assert_eq!(repo.list(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_row_can_be_deleted() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlitePendingRecordRepository::new(db.pool().clone());
        sqlx::query(
            "INSERT INTO pending_records (record_type, payload, created_at) VALUES ('pour', 'garbage', ?)",
        )
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();

        let row = repo.oldest().await.unwrap().unwrap();
        assert!(row.decode().unwrap_err().is_malformed());
        assert!(repo.delete(row.id).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
