//! In-memory backend for tests.
//!
//! Has no server-side sort, so "latest" is a client-side reduction.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::models::*;
use super::store::{ObservationBackend, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    None,
    Unavailable,
    Write,
    Hang,
}

pub struct MemoryBackend {
    records: Mutex<Vec<(u64, ObservationRecord)>>,
    mode: Mutex<FailMode>,
    calls: AtomicUsize,
    schema_calls: AtomicUsize,
    schema_failures: AtomicUsize,
    has_schema: AtomicBool,
    unmapped_appends: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            mode: Mutex::new(FailMode::None),
            calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            schema_failures: AtomicUsize::new(0),
            has_schema: AtomicBool::new(false),
            unmapped_appends: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, mode: FailMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of append/latest/history calls that reached the backend.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` schema creations as unavailable.
    pub fn fail_schema_times(&self, n: usize) {
        self.schema_failures.store(n, Ordering::SeqCst);
    }

    pub fn has_schema(&self) -> bool {
        self.has_schema.load(Ordering::SeqCst)
    }

    /// Appends that arrived before the schema was created.
    pub fn unmapped_appends(&self) -> usize {
        self.unmapped_appends.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<ObservationRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            FailMode::None => Ok(()),
            FailMode::Unavailable => Err(StoreError::Unavailable("connection refused".to_string())),
            FailMode::Write => Err(StoreError::Write("mapper_parsing_exception".to_string())),
            FailMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    fn sorted_desc(&self, service: Option<&str>) -> Vec<(u64, ObservationRecord)> {
        let mut matching: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| service.map_or(true, |s| r.service_name == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.1.timestamp, b.0).cmp(&(a.1.timestamp, a.0)));
        matching
    }
}

/// Max by timestamp, ties to the highest insertion id.
pub fn reduce_latest<I>(records: I) -> Option<(u64, ObservationRecord)>
where
    I: IntoIterator<Item = (u64, ObservationRecord)>,
{
    records
        .into_iter()
        .max_by(|a, b| (a.1.timestamp, a.0).cmp(&(b.1.timestamp, b.0)))
}

#[async_trait]
impl ObservationBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.gate().await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let pending = self
            .schema_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(StoreError::Unavailable("cluster not ready".to_string()));
        }
        self.has_schema.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, record: &ObservationRecord) -> Result<StoreId, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        if !self.has_schema() {
            self.unmapped_appends.fetch_add(1, Ordering::SeqCst);
        }
        let mut records = self.records.lock().unwrap();
        let id = records.len() as u64 + 1;
        records.push((id, record.clone()));
        Ok(StoreId(id.to_string()))
    }

    async fn latest(&self, service: &str) -> Result<Option<StoredObservation>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let records = self.records.lock().unwrap().clone();
        let latest = reduce_latest(records.into_iter().filter(|(_, r)| r.service_name == service));
        Ok(latest.map(|(id, record)| StoredObservation {
            id: StoreId(id.to_string()),
            record,
        }))
    }

    async fn history(&self, service: Option<&str>, limit: usize) -> Result<HistoryPage, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let matching = self.sorted_desc(service);
        Ok(HistoryPage {
            total: matching.len() as u64,
            results: matching.into_iter().take(limit).map(|(_, r)| r).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HealthState;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    #[test]
    fn test_reduce_latest_any_permutation() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records: Vec<(u64, ObservationRecord)> = (0..4)
            .map(|i| {
                let status = if i == 2 { HealthState::Down } else { HealthState::Up };
                let secs = [5, 1, 9, 3][i as usize];
                (i + 1, ObservationRecord::at("web", status, "h", base + ChronoDuration::seconds(secs)))
            })
            .collect();

        let mut perm = records.clone();
        for _ in 0..perm.len() {
            perm.rotate_left(1);
            let (id, record) = reduce_latest(perm.clone()).unwrap();
            assert_eq!(id, 3);
            assert_eq!(record.service_status, HealthState::Down);
        }
        assert!(reduce_latest(Vec::new()).is_none());
    }
}
