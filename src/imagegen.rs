use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

#[derive(Debug, Error)]
pub enum ImageGenError {
    #[error("image proxy request failed: {0}")]
    Request(String),
    #[error("image task failed: {0}")]
    Task(String),
    #[error("image task did not finish within {0:?}")]
    Timeout(Duration),
    #[error("invalid image proxy response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone)]
pub struct ImageProxyConfig {
    pub base_url: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl ImageProxyConfig {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("IMAGE_PROXY_BASE_URL").ok()?;
        let poll_interval = env_secs("IMAGE_POLL_INTERVAL_SECS", 3);
        let poll_timeout = env_secs("IMAGE_POLL_TIMEOUT_SECS", 60);
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            poll_timeout,
        })
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Car image rendering, behind a trait so pipeline tests can substitute a
/// canned renderer.
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    async fn generate(&self, model_description: &str) -> Result<String, ImageGenError>;
}

/// Client for the asynchronous rendering proxy: submit a task, poll its
/// status at a fixed interval, and hand back the durable URL the proxy
/// assigned once the render is done. Exceeding the poll timeout is a
/// terminal failure for the invocation; there is no partial result.
pub struct ImageProxyClient {
    config: ImageProxyConfig,
    http: Client,
}

impl ImageProxyClient {
    pub fn new(config: ImageProxyConfig) -> Self {
        Self {
            config,
            http: build_client(),
        }
    }

    async fn poll(&self, task_id: &str) -> Result<String, ImageGenError> {
        let status_url = format!("{}/status/{}", self.config.base_url, task_id);
        let deadline = Instant::now() + self.config.poll_timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(ImageGenError::Timeout(self.config.poll_timeout));
            }
            sleep(self.config.poll_interval).await;

            let response = self
                .http
                .get(&status_url)
                .send()
                .await
                .map_err(|err| ImageGenError::Request(err.to_string()))?;
            if !response.status().is_success() {
                return Err(ImageGenError::Request(format!(
                    "HTTP {}",
                    response.status()
                )));
            }
            let status: StatusResponse = response
                .json()
                .await
                .map_err(|err| ImageGenError::Deserialize(err.to_string()))?;

            match status.status.as_str() {
                "done" => {
                    return status.image_url.ok_or_else(|| {
                        ImageGenError::Deserialize("done task without image_url".into())
                    });
                }
                "error" => {
                    return Err(ImageGenError::Task(
                        status.error.unwrap_or_else(|| "unknown task error".into()),
                    ));
                }
                // pending / processing keep polling until the deadline
                _ => {}
            }
        }
    }
}

#[async_trait]
impl ImageRenderer for ImageProxyClient {
    async fn generate(&self, model_description: &str) -> Result<String, ImageGenError> {
        let submit_url = format!("{}/generate", self.config.base_url);
        let response = self
            .http
            .post(submit_url)
            .json(&GenerateRequest {
                model: model_description,
            })
            .send()
            .await
            .map_err(|err| ImageGenError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ImageGenError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let submitted: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ImageGenError::Deserialize(err.to_string()))?;

        self.poll(&submitted.task_id).await
    }
}
