//! Durable outbound queue for the kegtap engine.
//!
//! Pours and temperature readings that could not be delivered live are
//! written to a local SQLite database and replayed later, oldest first.
//!
//! - [`Database`] - connection pool with embedded migrations
//! - [`PendingRecordRepository`] - FIFO queue operations
//! - [`PendingRecord`] - the tagged record stored in each row
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use kegtap_core::backend::RecordTemperatureRequest;
//! use kegtap_storage::{
//!     Database, DatabaseConfig, PendingRecord, PendingRecordRepository,
//!     SqlitePendingRecordRepository,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(DatabaseConfig::new("kegtap.db")).await?;
//! let queue = SqlitePendingRecordRepository::new(db.pool().clone());
//!
//! queue
//!     .enqueue(&PendingRecord::Thermo(RecordTemperatureRequest {
//!         sensor_name: "kegboard.thermo-0".into(),
//!         temperature_c: 4.5,
//!         record_date: Utc::now(),
//!     }))
//!     .await?;
//!
//! if let Some(row) = queue.oldest().await? {
//!     println!("next up: {} #{}", row.record_type, row.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;

pub use connection::{Database, DatabaseConfig};
pub use error::{StorageError, StorageResult};
pub use models::{PendingRecord, PendingRow};
pub use repositories::{PendingRecordRepository, SqlitePendingRecordRepository};
