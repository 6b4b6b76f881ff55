//! HTTP probe implementation.

use std::time::Duration;

use async_trait::async_trait;

use super::{Probe, ProbeError};

/// UP if the URL answers with anything other than a server error.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self { url, client, timeout })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError::Protocol(format!("{} answered {}", self.url, status)));
        }

        Ok(())
    }
}
