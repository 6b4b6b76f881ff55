//! Append-only observation store.
//!
//! [`ObservationStore`] owns the policy (limits, timeouts, schema bootstrap
//! before first use); an [`ObservationBackend`] owns the wire protocol.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::models::*;

/// Store error types.
///
/// For `append`: `Unavailable` and `Write` mean the record was definitely not
/// written, `Indeterminate` means it may or may not have been.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store outcome unknown: {0}")]
    Indeterminate(String),
    #[error("store rejected write: {0}")]
    Write(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("malformed store response: {0}")]
    Decode(String),
}

/// A document service that can append records and answer sorted queries.
///
/// Implementations must be safe to share across concurrent requests.
#[async_trait]
pub trait ObservationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create the collection with its field typing if it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn append(&self, record: &ObservationRecord) -> Result<StoreId, StoreError>;

    /// Newest record for `service` by timestamp, ties broken by insertion order.
    async fn latest(&self, service: &str) -> Result<Option<StoredObservation>, StoreError>;

    /// Records newest first; `limit` has already been validated.
    async fn history(&self, service: Option<&str>, limit: usize) -> Result<HistoryPage, StoreError>;
}

/// Persistence and query surface for observations.
#[derive(Clone)]
pub struct ObservationStore {
    backend: Arc<dyn ObservationBackend>,
    timeout: Duration,
    schema: Arc<OnceCell<()>>,
}

impl ObservationStore {
    /// Wrap a backend; every call is cut off after `timeout`.
    pub fn new(backend: Arc<dyn ObservationBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            schema: Arc::new(OnceCell::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Poll the backend until it answers or `attempts` run out.
    pub async fn wait_until_ready(&self, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts.max(1) {
            match self.bounded(self.backend.ping(), StoreError::Unavailable).await {
                Ok(()) => {
                    tracing::info!("{} store is ready", self.backend.name());
                    return true;
                }
                Err(e) => {
                    tracing::info!(
                        "Waiting for {} store... ({}/{}): {}",
                        self.backend.name(),
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        tracing::warn!("Could not reach {} store, continuing degraded", self.backend.name());
        false
    }

    /// Create the backing collection now, logging a failure instead of returning it.
    ///
    /// Only success is remembered: after a failure the next store call tries again.
    pub async fn bootstrap(&self) -> bool {
        match self.ensure_schema().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error creating {} schema: {}", self.backend.name(), e);
                false
            }
        }
    }

    /// At most one successful schema creation per process; concurrent callers wait on it.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| async {
                self.bounded(self.backend.ensure_schema(), StoreError::Unavailable)
                    .await
                    .map(|()| tracing::info!("{} schema ready", self.backend.name()))
            })
            .await
            .map(|_| ())
    }

    /// Durably append one record.
    ///
    /// The record is never sent before the schema exists. A timeout on the
    /// append itself is reported as [`StoreError::Indeterminate`].
    pub async fn append(&self, record: &ObservationRecord) -> Result<StoreId, StoreError> {
        self.ensure_schema().await?;
        self.bounded(self.backend.append(record), StoreError::Indeterminate)
            .await
    }

    /// Latest known record for one service, if any.
    pub async fn latest(&self, service: &str) -> Result<Option<StoredObservation>, StoreError> {
        self.ensure_schema().await?;
        self.bounded(self.backend.latest(service), StoreError::Unavailable)
            .await
    }

    /// Filtered history, newest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<HistoryPage, StoreError> {
        let limit = validate_limit(filter.limit)?;
        self.ensure_schema().await?;
        self.bounded(
            self.backend.history(filter.service.as_deref(), limit),
            StoreError::Unavailable,
        )
        .await
    }

    async fn bounded<T, F>(
        &self,
        call: F,
        on_timeout: fn(String) -> StoreError,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!(
                "{} call timed out after {:?}",
                self.backend.name(),
                self.timeout
            ))),
        }
    }
}

/// Check a requested page size against `1..=MAX_HISTORY_SIZE`.
pub fn validate_limit(limit: i64) -> Result<usize, StoreError> {
    if limit <= 0 {
        return Err(StoreError::InvalidQuery(format!(
            "size must be positive, got {}",
            limit
        )));
    }
    if limit > MAX_HISTORY_SIZE {
        return Err(StoreError::InvalidQuery(format!(
            "size must not exceed {}, got {}",
            MAX_HISTORY_SIZE, limit
        )));
    }
    Ok(limit as usize)
}
