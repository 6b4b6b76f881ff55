//! Capability table mapping service identifiers to probes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use super::{AmqpProbe, HealthState, HttpProbe, PostgresProbe, Probe, SystemdProbe, TcpProbe};
use crate::config::{ProbeMode, ServerConfig};

/// The fixed, ordered set of monitored services and how to probe each one.
///
/// Built once at start-up and shared read-only afterwards.
pub struct ProbeRegistry {
    entries: Vec<(String, Arc<dyn Probe>)>,
    timeout: Duration,
}

impl ProbeRegistry {
    /// Create an empty registry whose probe calls are cut off after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            timeout,
        }
    }

    /// Build the httpd / rabbitmq / postgresql registry described by the configuration.
    pub fn from_config(cfg: &ServerConfig) -> Self {
        let mut registry = Self::new(cfg.probe_timeout);
        let timeout = cfg.probe_timeout;

        match cfg.probe_mode {
            ProbeMode::Systemd => {
                registry.register("httpd", Arc::new(SystemdProbe::new(&cfg.httpd.unit, timeout)));
                registry.register("rabbitmq", Arc::new(SystemdProbe::new(&cfg.rabbitmq.unit, timeout)));
                registry.register(
                    "postgresql",
                    Arc::new(SystemdProbe::new(&cfg.postgres.endpoint.unit, timeout)),
                );
            }
            ProbeMode::Network => {
                let httpd_url = format!("http://{}:{}/", cfg.httpd.host, cfg.httpd.port);
                match HttpProbe::new(&httpd_url, timeout) {
                    Ok(probe) => registry.register("httpd", Arc::new(probe)),
                    Err(e) => {
                        tracing::warn!("HTTP probe unavailable for httpd ({}), using TCP check", e);
                        registry.register(
                            "httpd",
                            Arc::new(TcpProbe::new(&cfg.httpd.host, cfg.httpd.port, timeout)),
                        );
                    }
                }
                registry.register(
                    "rabbitmq",
                    Arc::new(AmqpProbe::new(&cfg.rabbitmq.host, cfg.rabbitmq.port, timeout)),
                );
                registry.register(
                    "postgresql",
                    Arc::new(PostgresProbe::new(
                        &cfg.postgres.endpoint.host,
                        cfg.postgres.endpoint.port,
                        &cfg.postgres.user,
                        &cfg.postgres.database,
                        timeout,
                    )),
                );
            }
        }

        registry
    }

    /// Register a probe for `service`.
    ///
    /// Re-registering an existing service replaces its probe but keeps its position.
    pub fn register(&mut self, service: impl Into<String>, probe: Arc<dyn Probe>) {
        let service = service.into();
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| *name == service) {
            entry.1 = probe;
        } else {
            self.entries.push((service, probe));
        }
    }

    /// Service identifiers in registration order.
    pub fn list_services(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == service)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn get(&self, service: &str) -> Option<Arc<dyn Probe>> {
        self.entries
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, probe)| probe.clone())
    }

    /// Probe one service. Never fails: anything short of a clean `Ok` is DOWN.
    pub async fn probe(&self, service: &str) -> HealthState {
        match self.get(service) {
            Some(probe) => run_guarded(service.to_string(), probe, self.timeout).await,
            None => {
                tracing::warn!("No probe registered for {}, reporting DOWN", service);
                HealthState::Down
            }
        }
    }
}

/// Run a probe on its own task so that a hang or a panic degrades to DOWN.
///
/// The task is aborted if the returned future is dropped.
pub async fn run_guarded(
    service: String,
    probe: Arc<dyn Probe>,
    timeout: Duration,
) -> HealthState {
    let kind = probe.kind();
    let mut task = JoinSet::new();
    task.spawn(async move { tokio::time::timeout(timeout, probe.check()).await });

    match task.join_next().await {
        Some(Ok(Ok(Ok(())))) => HealthState::Up,
        Some(Ok(Ok(Err(e)))) => {
            tracing::warn!("Probe {} ({}) reported DOWN: {}", service, kind, e);
            HealthState::Down
        }
        Some(Ok(Err(_))) => {
            tracing::warn!("Probe {} ({}) timed out after {:?}", service, kind, timeout);
            HealthState::Down
        }
        Some(Err(e)) => {
            tracing::error!("Probe {} ({}) aborted: {}", service, kind, e);
            HealthState::Down
        }
        None => HealthState::Down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::probe::testing::*;

    #[tokio::test]
    async fn test_probe_outcomes_map_to_states() {
        let mut registry = ProbeRegistry::new(Duration::from_millis(50));
        registry.register("web", Arc::new(StaticProbe::up()));
        registry.register("db", Arc::new(StaticProbe::down()));
        registry.register("queue", Arc::new(HangingProbe));
        registry.register("cache", Arc::new(PanickingProbe));

        assert_eq!(registry.probe("web").await, HealthState::Up);
        assert_eq!(registry.probe("db").await, HealthState::Down);
        assert_eq!(registry.probe("queue").await, HealthState::Down);
        assert_eq!(registry.probe("cache").await, HealthState::Down);
        assert_eq!(registry.probe("missing").await, HealthState::Down);
    }

    #[test]
    fn test_registration_order_is_stable() {
        let mut registry = ProbeRegistry::new(Duration::from_secs(1));
        registry.register("web", Arc::new(StaticProbe::up()));
        registry.register("queue", Arc::new(StaticProbe::up()));
        registry.register("db", Arc::new(StaticProbe::up()));
        registry.register("web", Arc::new(StaticProbe::down()));

        assert_eq!(registry.list_services(), vec!["web", "queue", "db"]);
        assert_eq!(registry.list_services(), registry.list_services());
        assert!(registry.contains("db"));
        assert!(!registry.contains("rbcapp1"));
    }

    #[test]
    fn test_from_config_registers_known_services() {
        let registry = ProbeRegistry::from_config(&ServerConfig::default());
        assert_eq!(registry.list_services(), vec!["httpd", "rabbitmq", "postgresql"]);
        assert_eq!(registry.get("rabbitmq").map(|p| p.kind()), Some("amqp"));
        assert_eq!(registry.get("postgresql").map(|p| p.kind()), Some("postgres"));
    }
}
