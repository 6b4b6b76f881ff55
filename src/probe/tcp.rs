//! TCP reachability probe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Probe, ProbeError};

/// Open a TCP connection within `timeout`.
pub(crate) async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProbeError::Network(format!(
            "failed to connect to {}:{}: {}",
            host, port, e
        ))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// UP if a TCP connection can be established.
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        connect(&self.host, self.port, self.timeout).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        // Bind then drop to get a port nobody is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.check().await.is_err());
    }
}
