//! PostgreSQL startup handshake probe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::tcp::connect;
use super::{Probe, ProbeError};

/// Protocol version 3.0
const PROTOCOL_VERSION: i32 = 196_608;

/// UP if the server answers a StartupMessage with an authentication request.
///
/// No credentials are sent; the connection is dropped once the server has
/// shown it is accepting sessions for the configured user and database.
pub struct PostgresProbe {
    host: String,
    port: u16,
    user: String,
    database: String,
    timeout: Duration,
}

impl PostgresProbe {
    pub fn new(host: &str, port: u16, user: &str, database: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            database: database.to_string(),
            timeout,
        }
    }

    async fn handshake(&self) -> Result<(), ProbeError> {
        let mut stream = connect(&self.host, self.port, self.timeout).await?;

        stream
            .write_all(&startup_message(&self.user, &self.database))
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send startup message: {}", e)))?;

        let mut tag = [0u8; 1];
        stream
            .read_exact(&mut tag)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to read startup reply: {}", e)))?;

        match tag[0] {
            b'R' => Ok(()),
            b'E' => {
                let mut body = vec![0u8; 512];
                let n = stream.read(&mut body).await.unwrap_or(0);
                Err(ProbeError::Protocol(format!(
                    "server refused startup: {}",
                    error_message(&body[..n]).unwrap_or_else(|| "unknown error".to_string())
                )))
            }
            other => Err(ProbeError::Protocol(format!(
                "unexpected startup reply {:?}",
                other as char
            ))),
        }
    }
}

#[async_trait]
impl Probe for PostgresProbe {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        tokio::time::timeout(self.timeout, self.handshake())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

/// Encode a StartupMessage carrying `user` and `database`.
fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    packet.extend_from_slice(&body);
    packet
}

/// Pull the `M` (message) field out of an ErrorResponse body (length prefix included).
fn error_message(body: &[u8]) -> Option<String> {
    let fields = body.get(4..)?;
    fields
        .split(|b| *b == 0)
        .find(|field| field.first() == Some(&b'M'))
        .map(|field| String::from_utf8_lossy(&field[1..]).into_owned())
}
