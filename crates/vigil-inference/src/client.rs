//! HTTP client for the perception service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

use vigil_models::{Frame, InferenceOutput, ModelId};

use crate::backend::PerceptionBackend;
use crate::error::{InferenceError, InferenceResult};
use crate::metrics::record_request;

/// Perception client configuration.
#[derive(Debug, Clone)]
pub struct PerceptionClientConfig {
    /// Service root, e.g. `http://perception:8000`.
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Bearer token, if the service requires one.
    pub api_key: Option<String>,
}

impl Default for PerceptionClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            api_key: None,
        }
    }
}

impl PerceptionClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("PERCEPTION_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            timeout: Duration::from_secs(
                std::env::var("PERCEPTION_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("PERCEPTION_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
            ),
            api_key: std::env::var("PERCEPTION_API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    model_id: &'a str,
    device: &'a str,
    frames: Vec<FramePayload<'a>>,
}

#[derive(Debug, Serialize)]
struct FramePayload<'a> {
    stream_id: &'a str,
    sequence: u64,
    timestamp: f64,
    content_type: &'a str,
    image: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<InferenceOutput>,
}

/// Perception service client.
#[derive(Debug, Clone)]
pub struct HttpPerceptionClient {
    http: Client,
    config: PerceptionClientConfig,
}

impl HttpPerceptionClient {
    pub fn new(config: PerceptionClientConfig) -> InferenceResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("vigil-inference/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> InferenceResult<Self> {
        Self::new(PerceptionClientConfig::from_env())
    }

    fn batch_url(&self) -> String {
        format!("{}/api/detect/batch", self.config.base_url.trim_end_matches('/'))
    }

    /// Check service health.
    pub async fn health(&self) -> InferenceResult<()> {
        let url = format!("{}/api/health", self.config.base_url.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        record_request(status.as_u16());
        if status.is_success() {
            Ok(())
        } else {
            Err(InferenceError::from_http_status(status.as_u16(), format!("{url} failed")))
        }
    }
}

#[async_trait]
impl PerceptionBackend for HttpPerceptionClient {
    async fn infer_batch(
        &self,
        model: &ModelId,
        device: &str,
        frames: &[Frame],
    ) -> InferenceResult<Vec<InferenceOutput>> {
        let body = BatchRequest {
            model_id: model.as_str(),
            device,
            frames: frames
                .iter()
                .map(|f| FramePayload {
                    stream_id: f.stream_id.as_str(),
                    sequence: f.sequence,
                    timestamp: f.captured_at.timestamp_millis() as f64 / 1000.0,
                    content_type: &f.image.content_type,
                    image: base64::engine::general_purpose::STANDARD.encode(f.image.bytes.as_slice()),
                })
                .collect(),
        };

        let url = self.batch_url();
        let span = info_span!("perception_request", model = %model, device = %device, frames = frames.len());

        async {
            let start = Instant::now();
            let mut request = self.http.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await?;
            let status = response.status();
            record_request(status.as_u16());

            if status != StatusCode::OK {
                let text = response.text().await.unwrap_or_default();
                return Err(InferenceError::from_http_status(
                    status.as_u16(),
                    format!("{url} failed: {text}"),
                ));
            }

            let parsed: BatchResponse = response
                .json()
                .await
                .map_err(|e| InferenceError::invalid_response(e.to_string()))?;
            debug!(
                results = parsed.results.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Perception batch complete"
            );
            Ok::<_, InferenceError>(parsed.results)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_models::{FrameData, StreamId};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> HttpPerceptionClient {
        HttpPerceptionClient::new(PerceptionClientConfig {
            base_url,
            api_key: Some("secret".into()),
            ..PerceptionClientConfig::default()
        })
        .unwrap()
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(StreamId::from("cam-1"), seq, FrameData::jpeg(vec![0xFF, 0xD8, 0xFF]))
    }

    #[tokio::test]
    async fn test_infer_batch_posts_frames() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/detect/batch"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model_id": "detector",
                "device": "cuda:0",
                "frames": [{"stream_id": "cam-1", "sequence": 1, "image": "/9j/"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "results": [{
                    "detections": [{"class": "cell phone", "confidence": 0.91, "bbox": {"x1": 1, "y1": 2, "x2": 3, "y2": 4}}],
                    "latency_ms": 12.5
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outputs = client(server.uri())
            .infer_batch(&ModelId::from("detector"), "cuda:0", &[frame(1)])
            .await
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].detections[0].class_name, "cell phone");
        assert!(outputs[0].poses.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/detect/batch"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .infer_batch(&ModelId::from("detector"), "cpu", &[frame(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::ServerError(503, _)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(server.uri())
            .infer_batch(&ModelId::from("detector"), "cpu", &[frame(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(client(format!("{}/", server.uri())).health().await.is_ok());
    }
}
