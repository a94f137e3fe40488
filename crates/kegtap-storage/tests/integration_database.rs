//! Integration tests for the queue database.
//!
//! Run with: cargo test --package kegtap-storage --test integration_database

use std::sync::Arc;

use chrono::Utc;
use kegtap_core::backend::{RecordDrinkRequest, RecordTemperatureRequest};
use kegtap_storage::{
    Database, DatabaseConfig, PendingRecord, PendingRecordRepository,
    SqlitePendingRecordRepository,
};
use tokio::sync::Barrier;

fn pour(tap: &str) -> PendingRecord {
    PendingRecord::Pour(RecordDrinkRequest {
        tap: tap.to_string(),
        volume_ml: 473.0,
        ticks: 2554,
        shout: "cheers".to_string(),
        username: "bob".to_string(),
        record_date: Utc::now(),
        duration_ms: 6100,
        tick_time_series: Vec::new(),
        picture: None,
    })
}

#[tokio::test]
async fn test_in_memory_database() {
    let db = Database::in_memory().await.unwrap();
    db.health_check().await.unwrap();
    db.close().await;
}

#[tokio::test]
async fn test_migration_idempotency() {
    let db = Database::in_memory().await.unwrap();

    db.migrate().await.unwrap();
    db.migrate().await.unwrap();

    let result: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='pending_records'",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();

    assert_eq!(result.0, 1);
    db.close().await;
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("queue.db");
    let config = DatabaseConfig::new(path.to_string_lossy());

    {
        let db = Database::new(config.clone()).await.unwrap();
        let queue = SqlitePendingRecordRepository::new(db.pool().clone());
        queue.enqueue(&pour("kegboard.flow0")).await.unwrap();
        queue
            .enqueue(&PendingRecord::Thermo(RecordTemperatureRequest {
                sensor_name: "kegboard.thermo-0".into(),
                temperature_c: 2.25,
                record_date: Utc::now(),
            }))
            .await
            .unwrap();
        db.close().await;
    }

    assert!(path.exists());

    let db = Database::new(config).await.unwrap();
    let queue = SqlitePendingRecordRepository::new(db.pool().clone());
    assert_eq!(queue.count().await.unwrap(), 2);

    let oldest = queue.oldest().await.unwrap().unwrap();
    match oldest.decode().unwrap() {
        PendingRecord::Pour(request) => {
            assert_eq!(request.tap, "kegboard.flow0");
            assert_eq!(request.shout, "cheers");
        }
        other => panic!("unexpected {other:?}"),
    }
    db.close().await;
}

#[tokio::test]
async fn test_concurrent_enqueue_keeps_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::new(dir.path().join("queue.db").to_string_lossy());
    let db = Database::new(config).await.unwrap();

    const NUM_CONCURRENT_TASKS: usize = 8;
    let barrier = Arc::new(Barrier::new(NUM_CONCURRENT_TASKS));

    let handles: Vec<_> = (0..NUM_CONCURRENT_TASKS)
        .map(|i| {
            let queue = SqlitePendingRecordRepository::new(db.pool().clone());
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                queue.enqueue(&pour(&format!("kegboard.flow{i}"))).await.unwrap()
            })
        })
        .collect();

    let mut ids: Vec<i64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), NUM_CONCURRENT_TASKS);

    let queue = SqlitePendingRecordRepository::new(db.pool().clone());
    assert_eq!(queue.count().await.unwrap(), NUM_CONCURRENT_TASKS as i64);
    db.close().await;
}
