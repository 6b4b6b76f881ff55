//! Probe doubles shared by unit tests.

use super::{Probe, ProbeError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Probe with a fixed outcome that counts its invocations.
pub struct StaticProbe {
    up: bool,
    pub calls: Arc<AtomicUsize>,
}

impl StaticProbe {
    pub fn up() -> Self {
        Self { up: true, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn down() -> Self {
        Self { up: false, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for StaticProbe {
    fn kind(&self) -> &'static str {
        "static"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.up {
            Ok(())
        } else {
            Err(ProbeError::Network("connection refused".to_string()))
        }
    }
}

/// Probe that never completes on its own.
pub struct HangingProbe;

#[async_trait]
impl Probe for HangingProbe {
    fn kind(&self) -> &'static str {
        "hanging"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Probe whose implementation panics.
pub struct PanickingProbe;

#[async_trait]
impl Probe for PanickingProbe {
    fn kind(&self) -> &'static str {
        "panicking"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        panic!("probe implementation bug");
    }
}
