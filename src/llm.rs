//! Chat-completions client for an OpenAI-compatible endpoint.

use crate::config::LlmConfig;
use crate::error::{GenieError, Result, ServiceFailure};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// One system + user exchange sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.0,
            max_tokens: 500,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Anything that can turn a prompt into text. The pipeline only depends on this
/// trait, so tests can script the model.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    fn model_name(&self) -> &str;

    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt}
            ],
            "temperature": request.temperature,
        });
        // Newer model families only accept max_completion_tokens.
        if self.model.starts_with("gpt-4") || self.model.starts_with("gpt-5") || self.model.starts_with('o') {
            body["max_completion_tokens"] = json!(request.max_tokens);
        } else {
            body["max_tokens"] = json!(request.max_tokens);
        }
        body
    }
}

#[async_trait]
impl CompletionModel for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            GenieError::service(ServiceFailure::NotConfigured, "no API key configured")
        })?;

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| {
                let failure = if e.is_timeout() {
                    ServiceFailure::Timeout
                } else {
                    ServiceFailure::Network
                };
                GenieError::service(failure, format!("request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenieError::service(
                classify_status(status),
                format!("HTTP {}: {}", status, body),
            ));
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| {
            GenieError::service(ServiceFailure::MalformedResponse, format!("invalid JSON body: {}", e))
        })?;
        extract_content(&payload)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

fn classify_status(status: StatusCode) -> ServiceFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceFailure::Auth,
        StatusCode::TOO_MANY_REQUESTS => ServiceFailure::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceFailure::Timeout,
        s if s.is_server_error() => ServiceFailure::Unavailable,
        _ => ServiceFailure::MalformedResponse,
    }
}

fn extract_content(payload: &serde_json::Value) -> Result<String> {
    let malformed = |detail: &str| GenieError::service(ServiceFailure::MalformedResponse, detail);

    if let Some(error) = payload.get("error") {
        return Err(GenieError::service(
            ServiceFailure::Unavailable,
            format!("provider error: {}", error),
        ));
    }

    let choice = payload
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| malformed("response has no choices"))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("Model response was truncated at the token limit"),
        Some("content_filter") => return Err(malformed("response was filtered by content policy")),
        _ => {}
    }

    let content = choice["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| malformed("response has no message content"))?;

    debug!(chars = content.len(), "Model response received");
    Ok(content.to_string())
}
