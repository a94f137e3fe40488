use chrono::{DateTime, Utc};
use kegtap_core::backend::{RecordDrinkRequest, RecordTemperatureRequest};

use crate::error::{StorageError, StorageResult};

/// A record waiting for delivery to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRecord {
    Pour(RecordDrinkRequest),
    Thermo(RecordTemperatureRequest),
}

impl PendingRecord {
    pub const POUR: &'static str = "pour";
    pub const THERMO: &'static str = "thermo";

    /// Value of the `record_type` column.
    pub fn record_type(&self) -> &'static str {
        match self {
            PendingRecord::Pour(_) => Self::POUR,
            PendingRecord::Thermo(_) => Self::THERMO,
        }
    }

    /// JSON body stored in the `payload` column.
    pub fn to_payload(&self) -> StorageResult<String> {
        let payload = match self {
            PendingRecord::Pour(request) => serde_json::to_string(request)?,
            PendingRecord::Thermo(request) => serde_json::to_string(request)?,
        };
        Ok(payload)
    }

    pub fn from_parts(record_type: &str, payload: &str) -> StorageResult<Self> {
        match record_type {
            Self::POUR => Ok(PendingRecord::Pour(serde_json::from_str(payload)?)),
            Self::THERMO => Ok(PendingRecord::Thermo(serde_json::from_str(payload)?)),
            other => Err(StorageError::UnknownRecordType(other.to_string())),
        }
    }
}

/// One row of `pending_records`, payload still undecoded.
///
/// Kept raw so a malformed row can still be identified and deleted.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PendingRow {
    pub id: i64,
    pub record_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl PendingRow {
    pub fn decode(&self) -> StorageResult<PendingRecord> {
        PendingRecord::from_parts(&self.record_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn thermo() -> PendingRecord {
        PendingRecord::Thermo(RecordTemperatureRequest {
            sensor_name: "kegboard.thermo-1".into(),
            temperature_c: 3.5,
            record_date: Utc::now(),
        })
    }

    #[test]
    fn test_payload_round_trip() {
        let record = thermo();
        let payload = record.to_payload().unwrap();
        assert!(payload.contains("kegboard.thermo-1"));
        assert_eq!(
            PendingRecord::from_parts(record.record_type(), &payload).unwrap(),
            record
        );
    }

    #[test]
    fn test_payload_is_bare_request() {
        let payload = thermo().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["sensor_name"], "kegboard.thermo-1");
        assert!(value.get("Thermo").is_none());
    }

    #[rstest]
    #[case("pour", "{not json")]
    #[case("thermo", "{\"sensor_name\": 4}")]
    #[case("keg", "{}")]
    fn test_malformed_rows(#[case] record_type: &str, #[case] payload: &str) {
        let err = PendingRecord::from_parts(record_type, payload).unwrap_err();
        assert!(err.is_malformed());
    }
}
