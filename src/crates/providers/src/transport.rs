//! Outbound streaming call to an upstream endpoint.

use crate::config::TransportConfig;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;

/// Raw response body, delivered as network reads arrive.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens a streamed request against one endpoint.
///
/// `open` resolves once response headers are in. Anything that fails before
/// that point is a transport error; failures while reading surface as `Err`
/// items on the returned stream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &str, body: &serde_json::Value) -> Result<ByteStream>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Transport configuration in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, endpoint: &str, body: &serde_json::Value) -> Result<ByteStream> {
        let mut request = self.client.post(endpoint).json(body);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(endpoint, status = status.as_u16(), "Upstream stream opened");

        let stream = response.bytes_stream().map(|item| {
            item.map(|bytes| bytes.to_vec())
                .map_err(|e| ProviderError::Stream(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_creation() {
        let config = TransportConfig::new().with_connect_timeout(Duration::from_secs(1));
        let transport = HttpTransport::new(config).unwrap();
        assert_eq!(transport.config().connect_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        let transport = HttpTransport::new(
            TransportConfig::new().with_connect_timeout(Duration::from_millis(500)),
        )
        .unwrap();

        // Port 9 (discard) is closed on test machines.
        let result = transport
            .open("http://127.0.0.1:9/chat", &serde_json::json!({}))
            .await;
        assert!(result.is_err());
    }
}
