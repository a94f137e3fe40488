pub mod pending;

pub use pending::{PendingRecordRepository, SqlitePendingRecordRepository};
