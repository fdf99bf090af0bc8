use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::InferenceConfig;

#[derive(Debug, thiserror::Error)]
pub enum InferenceCallError {
    #[error("inference service returned HTTP {status}")]
    Status { status: u16, body: String },
    #[error("inference request failed: {0}")]
    Transport(String),
    #[error("inference request timed out")]
    TimedOut,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InferenceRequest {
    pub message: String,
    pub category: String,
}

/// Transport to the external inference service. Returns the raw success body.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn predict(&self, request: &InferenceRequest) -> Result<String, InferenceCallError>;
}

#[derive(Clone)]
pub struct HttpInferenceClient {
    http_client: HttpClient,
    predict_url: Url,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceCallError> {
        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| InferenceCallError::Transport(e.to_string()))?;
        let predict_url = Self::predict_url(&config.base_url)?;
        Ok(Self {
            http_client,
            predict_url,
            api_key: config.api_key.clone(),
        })
    }

    fn predict_url(base_url: &Url) -> Result<Url, InferenceCallError> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join("predict")
            .map_err(|e| InferenceCallError::Transport(format!("invalid inference URL: {}", e)))
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn predict(&self, request: &InferenceRequest) -> Result<String, InferenceCallError> {
        log::debug!("POST {} for category {}", self.predict_url, request.category);
        let mut builder = self.http_client.post(self.predict_url.clone()).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceCallError::TimedOut
            } else {
                InferenceCallError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                InferenceCallError::TimedOut
            } else {
                InferenceCallError::Transport(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(InferenceCallError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}
