//! Ollama HTTP backend (http://localhost:11434 by default).
//!
//! Uses the non-streaming `/api/generate` endpoint with `format: "json"`.
//! Startup helpers check the server and pull the configured model when the
//! server does not have it yet.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::provider::InferenceBackend;
use crate::config::OllamaConfig;
use crate::error::InferenceError;

const BACKEND_NAME: &str = "ollama";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TaggedModel>,
}

#[derive(Debug, Deserialize)]
struct TaggedModel {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| request_failed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Poll `GET /api/ps` until the server answers, up to `tries` times.
    pub async fn wait_until_ready(&self, tries: u32, delay: Duration) -> Result<(), InferenceError> {
        for attempt in 1..=tries {
            match self.client.get(self.url("/api/ps")).send().await {
                Ok(res) if res.status().is_success() => {
                    debug!(attempt, "Ollama is ready");
                    return Ok(());
                }
                Ok(res) => warn!(attempt, status = %res.status(), "Ollama not ready yet"),
                Err(e) => warn!(attempt, error = %e, "Ollama not reachable yet"),
            }
            if attempt < tries {
                tokio::time::sleep(delay).await;
            }
        }
        Err(InferenceError::NotReady {
            backend: BACKEND_NAME.to_string(),
            tries,
        })
    }

    /// `GET /api/tags`: names of the locally available models.
    pub async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let res = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| request_failed(e.to_string()))?;
        let res = check_status(res).await?;
        let tags: TagsResponse = res.json().await.map_err(|e| request_failed(e.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .filter_map(|m| m.name.or(m.model))
            .collect())
    }

    /// Pull the configured model if the server does not list it.
    pub async fn ensure_model(&self) -> Result<(), InferenceError> {
        let models = self.list_models().await?;
        if models.iter().any(|m| m == &self.model) {
            debug!(model = %self.model, "Model already present");
            return Ok(());
        }

        info!(model = %self.model, "Model not found, pulling");
        let body = serde_json::json!({ "model": self.model, "stream": false });
        let res = self
            .client
            .post(self.url("/api/pull"))
            // Pulls can take far longer than a generate call.
            .timeout(Duration::from_secs(3600))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failed(e.to_string()))?;
        check_status(res).await?;
        info!(model = %self.model, "Model pulled");
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_json(&self, prompt: &str) -> Result<String, InferenceError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            format: "json",
            stream: false,
        };
        let res = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failed(e.to_string()))?;
        let res = check_status(res).await?;
        let data: GenerateResponse = res.json().await.map_err(|e| request_failed(e.to_string()))?;
        debug!(len = data.response.len(), "Ollama response received");
        Ok(data.response.trim().to_string())
    }
}

fn request_failed(reason: String) -> InferenceError {
    InferenceError::RequestFailed {
        backend: BACKEND_NAME.to_string(),
        reason,
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(InferenceError::Status {
        backend: BACKEND_NAME.to_string(),
        status,
        body,
    })
}
