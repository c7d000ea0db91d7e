//! Direct request/response transport for port-0 destinations.
//!
//! Instead of enqueuing, the packet is POSTed to the destination node's
//! `/submit` endpoint. The queue name travels as a header so the receiver can
//! tell which logical input was targeted.

use std::time::Duration;
use async_trait::async_trait;
use tracing::{debug, warn};
use vd_common::Packet;

use crate::{PacketSink, QueueError, Result};

pub const QUEUE_HEADER: &str = "x-vdag-queue";

#[derive(Debug, Clone)]
pub struct DirectClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for DirectClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DirectClient {
    base_url: String,
    client: reqwest::Client,
}

impl DirectClient {
    pub fn new(host: &str, config: DirectClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PacketSink for DirectClient {
    async fn push(&self, queue: &str, packet: &Packet) -> Result<()> {
        let url = format!("{}/submit", self.base_url);
        debug!(url = %url, session_id = %packet.session_id, "Submitting packet directly");

        let response = self
            .client
            .post(&url)
            .header(QUEUE_HEADER, queue)
            .json(packet)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, body = %body, "Direct submit rejected");
            return Err(QueueError::Rejected { status: status.as_u16() });
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(QueueError::Unavailable(format!(
                "health probe returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_push_posts_packet_with_queue_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header(QUEUE_HEADER, "inbox"))
            .and(body_partial_json(json!({"sessionId": "s-1"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = DirectClient::new(&server.uri(), DirectClientConfig::default()).unwrap();
        client
            .push("inbox", &Packet::new("s-1", 1, json!({"text": "hi"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_maps_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = DirectClient::new(&server.uri(), DirectClientConfig::default()).unwrap();
        let err = client
            .push("inbox", &Packet::new("s", 1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Rejected { status: 503 }));
    }

    #[tokio::test]
    async fn test_ping_uses_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = DirectClient::new(&server.uri(), DirectClientConfig::default()).unwrap();
        assert!(client.ping().await.is_ok());
    }

    #[test]
    fn test_bare_host_gets_scheme() {
        let client = DirectClient::new("node-b:8080/", DirectClientConfig::default()).unwrap();
        assert_eq!(client.base_url(), "http://node-b:8080");
    }
}
