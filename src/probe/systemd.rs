//! systemd unit probe.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Probe, ProbeError};

/// UP if `systemctl is-active <unit>` prints `active`.
pub struct SystemdProbe {
    unit: String,
    timeout: Duration,
}

impl SystemdProbe {
    pub fn new(unit: &str, timeout: Duration) -> Self {
        Self {
            unit: unit.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for SystemdProbe {
    fn kind(&self) -> &'static str {
        "systemd"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let child = Command::new("systemctl")
            .arg("is-active")
            .arg(&self.unit)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|e| ProbeError::Command(format!("failed to run systemctl: {}", e)))?;

        unit_state(&self.unit, &String::from_utf8_lossy(&output.stdout))
    }
}

fn unit_state(unit: &str, stdout: &str) -> Result<(), ProbeError> {
    match stdout.trim() {
        "active" => Ok(()),
        "" => Err(ProbeError::Command(format!("no state reported for unit {}", unit))),
        other => Err(ProbeError::Command(format!("unit {} is {}", unit, other))),
    }
}
