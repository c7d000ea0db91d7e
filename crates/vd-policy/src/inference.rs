//! External inference collaborators (evaluators, summarizers, embedders)

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vd_config::InferenceConfig;

use crate::{PolicyError, Result};

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, model_id: &str, prompt: &str) -> Result<String>;

    /// Fire-and-forget variant; only a refused request is an error
    async fn trigger(&self, model_id: &str, prompt: &str) -> Result<()> {
        self.infer(model_id, prompt).await.map(|_| ())
    }

    async fn embed(&self, _model_id: &str, _text: &str) -> Result<Vec<f32>> {
        Err(PolicyError::Inference("embedding not supported".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpInferenceConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub trigger_timeout: Duration,
}

impl Default for HttpInferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout: Duration::from_secs(60),
            trigger_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&InferenceConfig> for HttpInferenceConfig {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(config.timeout_ms),
            trigger_timeout: Duration::from_millis(config.trigger_timeout_ms),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferRequest<'a> {
    model_id: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

/// JSON-over-HTTP client: `POST /infer`, `POST /trigger`, `POST /embed`
pub struct HttpInferenceClient {
    config: HttpInferenceConfig,
    client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(config: HttpInferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, model_id: &str, prompt: &str) -> Result<String> {
        let url = self.url("infer");
        debug!(url = %url, model_id = %model_id, prompt_len = prompt.len(), "Sending inference request");

        let response = self
            .client
            .post(&url)
            .json(&InferRequest { model_id, prompt })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyError::Inference(format!("HTTP {}: {}", status, body)));
        }
        Ok(response.json::<InferResponse>().await?.text)
    }

    async fn trigger(&self, model_id: &str, prompt: &str) -> Result<()> {
        let result = self
            .client
            .post(self.url("trigger"))
            .timeout(self.config.trigger_timeout)
            .json(&InferRequest { model_id, prompt })
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(PolicyError::Inference(format!(
                "trigger refused: HTTP {}",
                response.status()
            ))),
            // The receiver accepted the connection; not waiting for it is the point
            Err(e) if e.is_timeout() => {
                debug!(model_id = %model_id, "Trigger timed out waiting for reply");
                Ok(())
            }
            Err(e) => {
                warn!(model_id = %model_id, error = %e, "Trigger failed");
                Err(e.into())
            }
        }
    }

    async fn embed(&self, model_id: &str, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(self.url("embed"))
            .json(&EmbedRequest { model_id, text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::Inference(format!("embed failed: HTTP {}", status)));
        }
        Ok(response.json::<EmbedResponse>().await?.vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpInferenceClient {
        HttpInferenceClient::new(HttpInferenceConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
            trigger_timeout: Duration::from_millis(100),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_infer_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .and(body_json(json!({"modelId": "evaluator", "prompt": "rate this"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "0.8"})))
            .expect(1)
            .mount(&server)
            .await;

        let text = client_for(&server).infer("evaluator", "rate this").await.unwrap();
        assert_eq!(text, "0.8");
    }

    #[tokio::test]
    async fn test_infer_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client_for(&server).infer("m", "p").await.unwrap_err();
        assert!(matches!(err, PolicyError::Inference(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_trigger_does_not_wait_for_slow_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trigger"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        client_for(&server).trigger("m", "p").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_embed_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vector": [0.5, 1.0]})))
            .mount(&server)
            .await;

        let vector = client_for(&server).embed("e", "hello").await.unwrap();
        assert_eq!(vector, vec![0.5, 1.0]);
    }
}
