//! AMQP 0-9-1 handshake probe for the message broker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::tcp::connect;
use super::{Probe, ProbeError};

/// Protocol header a 0-9-1 client opens with.
const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

const FRAME_METHOD: u8 = 1;
const CLASS_CONNECTION: u16 = 10;
const METHOD_START: u16 = 10;

/// UP if the broker answers the protocol header with `Connection.Start`.
pub struct AmqpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl AmqpProbe {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }

    async fn handshake(&self) -> Result<(), ProbeError> {
        let mut stream = connect(&self.host, self.port, self.timeout).await?;

        stream
            .write_all(PROTOCOL_HEADER)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send protocol header: {}", e)))?;

        // 7-byte frame header followed by class-id and method-id
        let mut head = [0u8; 11];
        stream
            .read_exact(&mut head)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to read Connection.Start: {}", e)))?;

        parse_connection_start(&head)
    }
}

#[async_trait]
impl Probe for AmqpProbe {
    fn kind(&self) -> &'static str {
        "amqp"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        tokio::time::timeout(self.timeout, self.handshake())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

/// Validate the first bytes the broker sends back.
fn parse_connection_start(head: &[u8]) -> Result<(), ProbeError> {
    if head.len() < 11 {
        return Err(ProbeError::Protocol(format!("short frame: {} bytes", head.len())));
    }

    // A broker that does not speak our version replies with its own header and closes
    if head.starts_with(b"AMQP") {
        return Err(ProbeError::Protocol(format!(
            "broker rejected protocol, offers {}-{}-{}",
            head[5], head[6], head[7]
        )));
    }

    if head[0] != FRAME_METHOD {
        return Err(ProbeError::Protocol(format!("unexpected frame type {}", head[0])));
    }

    let channel = u16::from_be_bytes([head[1], head[2]]);
    let class_id = u16::from_be_bytes([head[7], head[8]]);
    let method_id = u16::from_be_bytes([head[9], head[10]]);
    if channel != 0 || class_id != CLASS_CONNECTION || method_id != METHOD_START {
        return Err(ProbeError::Protocol(format!(
            "expected Connection.Start on channel 0, got {}.{} on channel {}",
            class_id, method_id, channel
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn connection_start_head() -> Vec<u8> {
        let mut head = vec![FRAME_METHOD, 0, 0];
        head.extend_from_slice(&500u32.to_be_bytes());
        head.extend_from_slice(&CLASS_CONNECTION.to_be_bytes());
        head.extend_from_slice(&METHOD_START.to_be_bytes());
        head
    }

    #[test]
    fn test_parse_connection_start() {
        assert!(parse_connection_start(&connection_start_head()).is_ok());

        let mut wrong_method = connection_start_head();
        wrong_method[10] = 11;
        assert!(parse_connection_start(&wrong_method).is_err());

        let rejected = b"AMQP\x00\x00\x09\x01\x00\x00\x00";
        assert!(parse_connection_start(rejected).is_err());

        assert!(parse_connection_start(&[1, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_amqp_probe_against_fake_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            sock.read_exact(&mut header).await.unwrap();
            assert_eq!(&header, PROTOCOL_HEADER);
            sock.write_all(&connection_start_head()).await.unwrap();
        });

        let probe = AmqpProbe::new("127.0.0.1", port, Duration::from_secs(2));
        assert!(probe.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_amqp_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let probe = AmqpProbe::new("127.0.0.1", port, Duration::from_millis(100));
        assert!(matches!(probe.check().await, Err(ProbeError::Timeout(_))));
    }
}
