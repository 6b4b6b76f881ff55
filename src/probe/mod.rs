//! Probe module for dependency liveness checks.
//!
//! Supports systemd unit, TCP, HTTP, AMQP and PostgreSQL probes.

mod amqp;
mod http;
mod postgres;
mod registry;
mod systemd;
mod tcp;

#[cfg(test)]
pub(crate) mod testing;

pub use amqp::*;
pub use http::*;
pub use postgres::*;
pub use registry::*;
pub use systemd::*;
pub use tcp::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// These never leave the [`ProbeRegistry`]; every variant is reported as [`HealthState::Down`].
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Liveness of a single dependency, or of the application as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Up,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Up => "UP",
            HealthState::Down => "DOWN",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, HealthState::Up)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(HealthState::Up),
            "DOWN" => Ok(HealthState::Down),
            other => Err(format!("invalid status {:?}, expected \"UP\" or \"DOWN\"", other)),
        }
    }
}

impl From<bool> for HealthState {
    fn from(up: bool) -> Self {
        if up {
            HealthState::Up
        } else {
            HealthState::Down
        }
    }
}

/// A check that decides whether one dependency is reachable and healthy right now.
///
/// Implementations enforce their own timeout. `Ok(())` means UP; any error means DOWN.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Short label for logs, e.g. "tcp" or "systemd".
    fn kind(&self) -> &'static str;

    async fn check(&self) -> Result<(), ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_wire_format() {
        assert_eq!(serde_json::to_string(&HealthState::Up).unwrap(), "\"UP\"");
        assert_eq!(serde_json::to_string(&HealthState::Down).unwrap(), "\"DOWN\"");
        let parsed: HealthState = serde_json::from_str("\"DOWN\"").unwrap();
        assert_eq!(parsed, HealthState::Down);
    }

    #[test]
    fn test_health_state_parse() {
        assert_eq!("UP".parse::<HealthState>(), Ok(HealthState::Up));
        assert!("up".parse::<HealthState>().is_err());
        assert!("DEGRADED".parse::<HealthState>().is_err());
        assert_eq!(HealthState::from(false), HealthState::Down);
    }
}
