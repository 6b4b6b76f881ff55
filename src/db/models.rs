//! Observation model types.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::HealthState;

/// Wire format of `timestamp`: millisecond precision, UTC, `Z` suffix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Page size used when the caller does not ask for one.
pub const DEFAULT_HISTORY_SIZE: i64 = 10;
/// Largest page a history query may request.
pub const MAX_HISTORY_SIZE: i64 = 1000;

/// One immutable observation of a service's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub service_name: String,
    pub service_status: HealthState,
    pub host_name: String,
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ObservationRecord {
    /// An observation at a given instant, truncated to the stored precision.
    pub fn at(
        service_name: &str,
        service_status: HealthState,
        host_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_status,
            host_name: host_name.to_string(),
            timestamp: timestamp.trunc_subsecs(3),
        }
    }
}

/// Identifier the store assigned to an appended record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as read back from the store, with its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObservation {
    pub id: StoreId,
    #[serde(flatten)]
    pub record: ObservationRecord,
}

/// History query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFilter {
    pub service: Option<String>,
    pub limit: i64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            service: None,
            limit: DEFAULT_HISTORY_SIZE,
        }
    }
}

/// One page of history, newest first, plus the number of matching records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub total: u64,
    pub results: Vec<ObservationRecord>,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp as written by this service or by an external reporter.
///
/// Offsets are converted to UTC; naive values are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(3));
    }

    let formats = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc).trunc_subsecs(3));
        }
    }

    None
}

mod wire_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let record = ObservationRecord::at("httpd", HealthState::Up, "box-1", ts);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "service_name": "httpd",
                "service_status": "UP",
                "host_name": "box-1",
                "timestamp": "2024-05-01T12:30:00.123Z",
            })
        );

        let back: ObservationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::milliseconds(123);

        // Microsecond precision as older reporters write it
        assert_eq!(parse_timestamp("2024-05-01T12:30:00.123456Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T14:30:00.123+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:30:00.123"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_default_history_filter() {
        let filter = HistoryFilter::default();
        assert_eq!(filter.limit, DEFAULT_HISTORY_SIZE);
        assert!(filter.service.is_none());
    }
}
