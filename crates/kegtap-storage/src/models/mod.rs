pub mod pending;

pub use pending::{PendingRecord, PendingRow};
