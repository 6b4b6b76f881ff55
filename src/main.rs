//! HealthTrail - Service Health Aggregation
//!
//! Probes the application's dependencies, derives one application verdict,
//! and keeps an append-only history of observations.
//!
//! `healthtrail` serves the HTTP API; `healthtrail check` runs one monitoring
//! round, prints the recorded observations as JSON lines and exits non-zero
//! when the application is down.

mod config;
mod db;
mod health;
mod probe;
mod service;
mod web;

use config::ServerConfig;
use health::AggregationEngine;
use probe::ProbeRegistry;
use service::QueryService;
use web::Server;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging; stdout carries `check` output only
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("healthtrail=info".parse()?))
        .init();

    let one_shot = std::env::args().nth(1).as_deref() == Some("check");

    // Load configuration
    let cfg = ServerConfig::load();
    if !one_shot {
        tracing::info!("Starting HealthTrail on port {}...", cfg.http_port);
    }

    let registry = Arc::new(ProbeRegistry::from_config(&cfg));
    tracing::info!(
        "Monitoring {:?} with {:?} probes as {}",
        registry.list_services(),
        cfg.probe_mode,
        cfg.host_name
    );

    // Initialize store
    let store = db::open_store(&cfg)?;
    tracing::info!("Using {} store", store.backend_name());
    if !one_shot {
        store
            .wait_until_ready(cfg.store_wait_retries, Duration::from_secs(2))
            .await;
    }
    store.bootstrap().await;

    let engine = AggregationEngine::new(registry, cfg.aggregate_name.clone());
    let service = Arc::new(QueryService::new(
        engine,
        store,
        cfg.host_name.clone(),
        cfg.request_timeout,
    ));

    if one_shot {
        let up = run_check(&service, &mut std::io::stdout().lock()).await?;
        std::process::exit(if up { 0 } else { 1 });
    }

    // Start web server
    let server = Server::new(cfg, service);
    server.start().await?;

    Ok(())
}

/// One monitoring round with every write awaited; records go to `out`, one JSON object per line.
async fn run_check<W: Write>(
    service: &QueryService,
    out: &mut W,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let (report, outcomes) = service.monitor_round().await;

    let mut failed = 0;
    for (record, result) in &outcomes {
        serde_json::to_writer(&mut *out, record)?;
        writeln!(out)?;
        if result.is_err() {
            failed += 1;
        }
    }
    out.flush()?;
    if failed > 0 {
        tracing::warn!("{} of {} observations were not recorded", failed, outcomes.len());
    }

    tracing::info!(
        "{} is {}",
        service.engine().aggregate_name(),
        report.aggregate
    );
    Ok(report.aggregate.is_up())
}
