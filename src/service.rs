//! Public health query operations.
//!
//! Validates caller input before any I/O, runs the engine, and records
//! observations in the store. Health checks are live-probe-then-persist:
//! the probe result is authoritative and persistence failures are only logged.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::{
    parse_timestamp, HistoryFilter, HistoryPage, ObservationRecord, ObservationStore, StoreError,
    StoreId, StoredObservation, DEFAULT_HISTORY_SIZE,
};
use crate::health::{AggregationEngine, InvalidServiceError, ServiceStates};
use crate::probe::HealthState;

/// Fields every ingested observation must carry.
pub const REQUIRED_FIELDS: [&str; 3] = ["service_name", "service_status", "host_name"];

/// Errors surfaced to callers of the query service.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    InvalidService(#[from] InvalidServiceError),
    #[error("{0}")]
    InvalidQuery(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    StoreUnavailable(String),
    #[error("{0}")]
    StoreIndeterminate(String),
    #[error("{0}")]
    StoreWrite(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Stable machine-readable name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Validation(_) => "validation_error",
            QueryError::InvalidService(_) => "invalid_service",
            QueryError::InvalidQuery(_) => "invalid_query",
            QueryError::NotFound(_) => "not_found",
            QueryError::StoreUnavailable(_) => "store_unavailable",
            QueryError::StoreIndeterminate(_) => "store_indeterminate",
            QueryError::StoreWrite(_) => "store_write_error",
            QueryError::Timeout(_) => "timeout",
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidQuery(msg) => QueryError::InvalidQuery(msg),
            StoreError::Write(msg) => QueryError::StoreWrite(msg),
            StoreError::Indeterminate(msg) => QueryError::StoreIndeterminate(msg),
            StoreError::Unavailable(msg) | StoreError::Decode(msg) => QueryError::StoreUnavailable(msg),
        }
    }
}

/// Result of an accepted ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub id: StoreId,
    pub record: ObservationRecord,
}

/// Result of a full health check round.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub aggregate: HealthState,
    pub services: ServiceStates,
    pub timestamp: DateTime<Utc>,
}

/// Result of a single-service health check.
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub service_name: String,
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
}

/// The query surface shared by every request.
pub struct QueryService {
    engine: AggregationEngine,
    store: ObservationStore,
    host_name: String,
    request_timeout: Duration,
}

impl QueryService {
    pub fn new(
        engine: AggregationEngine,
        store: ObservationStore,
        host_name: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            host_name: host_name.into(),
            request_timeout,
        }
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Validate and append a caller-supplied observation.
    pub async fn ingest(&self, payload: Option<&Value>) -> Result<IngestOutcome, QueryError> {
        let record = parse_ingest(payload, Utc::now())?;

        let id = self
            .bounded(async { self.store.append(&record).await.map_err(QueryError::from) })
            .await
            .inspect_err(|e| tracing::error!("Ingest for {} failed: {}", record.service_name, e))?;

        tracing::info!(
            "Ingested {} {} from {} as {}",
            record.service_name,
            record.service_status,
            record.host_name,
            id
        );
        Ok(IngestOutcome { id, record })
    }

    /// Probe everything, persist the round in the background, return the verdict.
    pub async fn health_check_all(&self) -> Result<HealthReport, QueryError> {
        let report = self
            .bounded(async { Ok::<_, QueryError>(self.evaluate_round().await) })
            .await?;
        self.persist_detached(self.round_records(&report));
        Ok(report)
    }

    /// Probe one service (or the aggregate), persist in the background, return its state.
    pub async fn health_check_one(&self, service: &str) -> Result<ServiceReport, QueryError> {
        self.engine.validate(service)?;

        let status = self
            .bounded(async { self.engine.evaluate_one(service).await.map_err(QueryError::from) })
            .await?;
        let timestamp = Utc::now();

        self.persist_detached(vec![ObservationRecord::at(
            service,
            status,
            &self.host_name,
            timestamp,
        )]);

        Ok(ServiceReport {
            service_name: service.to_string(),
            status,
            timestamp,
        })
    }

    /// A page of history, newest first.
    ///
    /// `size` is the raw query parameter; absent means the default page size.
    pub async fn get_history(
        &self,
        service: Option<&str>,
        size: Option<&str>,
    ) -> Result<HistoryPage, QueryError> {
        let limit = match size.map(str::trim) {
            None | Some("") => DEFAULT_HISTORY_SIZE,
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| QueryError::InvalidQuery(format!("size must be an integer, got {:?}", raw)))?,
        };
        let filter = HistoryFilter {
            service: service.filter(|s| !s.is_empty()).map(str::to_string),
            limit,
        };

        self.bounded(async { self.store.history(&filter).await.map_err(QueryError::from) })
            .await
            .inspect_err(|e| tracing::error!("History query failed: {}", e))
    }

    /// The most recent persisted observation for a service, without probing.
    pub async fn latest(&self, service: &str) -> Result<StoredObservation, QueryError> {
        self.engine.validate(service)?;

        self.bounded(async { self.store.latest(service).await.map_err(QueryError::from) })
            .await?
            .ok_or_else(|| QueryError::NotFound(format!("No observations recorded for {}", service)))
    }

    /// One monitoring round whose writes are awaited, for the one-shot mode.
    pub async fn monitor_round(&self) -> (HealthReport, Vec<(ObservationRecord, Result<StoreId, StoreError>)>) {
        let report = self.evaluate_round().await;
        let records = self.round_records(&report);
        let outcomes = persist_all(&self.store, records).await;
        (report, outcomes)
    }

    async fn evaluate_round(&self) -> HealthReport {
        let eval = self.engine.evaluate_all().await;
        HealthReport {
            aggregate: eval.aggregate,
            services: eval.services,
            timestamp: Utc::now(),
        }
    }

    /// One record per service, then one for the aggregate.
    fn round_records(&self, report: &HealthReport) -> Vec<ObservationRecord> {
        report
            .services
            .iter()
            .map(|(service, state)| (service.to_string(), state))
            .chain(std::iter::once((
                self.engine.aggregate_name().to_string(),
                report.aggregate,
            )))
            .map(|(service, state)| {
                ObservationRecord::at(&service, state, &self.host_name, report.timestamp)
            })
            .collect()
    }

    fn persist_detached(&self, records: Vec<ObservationRecord>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            persist_all(&store, records).await;
        });
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, QueryError>>,
    {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| QueryError::Timeout(self.request_timeout))?
    }
}

/// Append records in order, logging the ones that did not make it.
async fn persist_all(
    store: &ObservationStore,
    records: Vec<ObservationRecord>,
) -> Vec<(ObservationRecord, Result<StoreId, StoreError>)> {
    let mut outcomes = Vec::with_capacity(records.len());
    for record in records {
        let result = store.append(&record).await;
        if let Err(e) = &result {
            tracing::warn!(
                "Failed to record {} {} observation: {}",
                record.service_name,
                record.service_status,
                e
            );
        }
        outcomes.push((record, result));
    }
    outcomes
}

/// Turn an ingest payload into a record, or say what is wrong with it.
pub fn parse_ingest(payload: Option<&Value>, now: DateTime<Utc>) -> Result<ObservationRecord, QueryError> {
    let fields = match payload {
        Some(Value::Object(fields)) if !fields.is_empty() => fields,
        _ => return Err(QueryError::Validation("No JSON data provided".to_string())),
    };

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| match fields.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .collect();
    if !missing.is_empty() {
        return Err(QueryError::Validation(format!(
            "Missing required field(s): {}",
            missing.join(", ")
        )));
    }

    let service_name = string_field(fields, "service_name")?;
    let host_name = string_field(fields, "host_name")?;
    let service_status: HealthState = string_field(fields, "service_status")?
        .parse()
        .map_err(QueryError::Validation)?;

    let timestamp = match fields.get("timestamp") {
        None | Some(Value::Null) => now,
        Some(Value::String(raw)) => parse_timestamp(raw).ok_or_else(|| {
            QueryError::Validation(format!("Field timestamp is not an ISO-8601 date: {:?}", raw))
        })?,
        Some(_) => return Err(QueryError::Validation("Field timestamp must be a string".to_string())),
    };

    Ok(ObservationRecord::at(service_name, service_status, host_name, timestamp))
}

fn string_field<'a>(fields: &'a Map<String, Value>, field: &str) -> Result<&'a str, QueryError> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| QueryError::Validation(format!("Field {} must be a string", field)))
}
