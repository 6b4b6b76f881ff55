use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;

use super::ServiceStates;
use crate::probe::{run_guarded, HealthState, ProbeRegistry};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid service name {service:?}, valid services: {valid:?}")]
pub struct InvalidServiceError {
    pub service: String,
    pub valid: Vec<String>,
}

/// One evaluation round: the aggregate verdict and the states it was computed from.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub aggregate: HealthState,
    pub services: ServiceStates,
}

/// Runs the registered probes and derives the application verdict.
///
/// Holds no state besides the registry; nothing is persisted from here.
#[derive(Clone)]
pub struct AggregationEngine {
    registry: Arc<ProbeRegistry>,
    aggregate_name: String,
}

impl AggregationEngine {
    pub fn new(registry: Arc<ProbeRegistry>, aggregate_name: impl Into<String>) -> Self {
        Self {
            registry,
            aggregate_name: aggregate_name.into(),
        }
    }

    /// Name of the pseudo-service carrying the aggregate verdict.
    pub fn aggregate_name(&self) -> &str {
        &self.aggregate_name
    }

    /// Known services followed by the aggregate pseudo-service.
    pub fn valid_services(&self) -> Vec<String> {
        let mut services = self.registry.list_services();
        services.push(self.aggregate_name.clone());
        services
    }

    /// Fails with [`InvalidServiceError`] for anything outside [`Self::valid_services`].
    pub fn validate(&self, service: &str) -> Result<(), InvalidServiceError> {
        if service == self.aggregate_name || self.registry.contains(service) {
            Ok(())
        } else {
            Err(InvalidServiceError {
                service: service.to_string(),
                valid: self.valid_services(),
            })
        }
    }

    /// Probe every service concurrently and AND the results.
    ///
    /// The verdict is computed only once every probe has finished or timed out.
    pub async fn evaluate_all(&self) -> Evaluation {
        let services = self.registry.list_services();
        let timeout = self.registry.timeout();

        let mut tasks = JoinSet::new();
        for (idx, service) in services.iter().enumerate() {
            let Some(probe) = self.registry.get(service) else {
                continue;
            };
            let service = service.clone();
            tasks.spawn(async move { (idx, run_guarded(service, probe, timeout).await) });
        }

        let mut states = vec![HealthState::Down; services.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, state)) => states[idx] = state,
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        let services = ServiceStates::new(services.into_iter().zip(states).collect());
        let aggregate = services.aggregate();
        tracing::debug!("Evaluation round: {} -> {}", self.aggregate_name, aggregate);

        Evaluation { aggregate, services }
    }

    /// Probe one service, or run a full round when asked for the aggregate.
    pub async fn evaluate_one(&self, service: &str) -> Result<HealthState, InvalidServiceError> {
        self.validate(service)?;

        if service == self.aggregate_name {
            return Ok(self.evaluate_all().await.aggregate);
        }

        Ok(self.registry.probe(service).await)
    }
}
