// src/llm.rs

use crate::config::{LlmBackend, LlmSection};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Failure talking to an external AI service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("AI backend disabled in configuration")]
    Disabled,

    #[error("LLM_API_KEY env var required for remote backend")]
    MissingApiKey,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("empty response from LLM")]
    EmptyResponse,

    #[error("malformed JSON in LLM response: {0}")]
    MalformedJson(String),

    #[error("failed to decode LLM response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Resolved endpoint configuration ready to make API calls.
#[derive(Debug, Clone)]
struct ResolvedEndpoint {
    base_url: String,
    model: String,
    api_key: String,
}

fn resolve_endpoint(llm: &LlmSection) -> Result<ResolvedEndpoint, ServiceError> {
    match llm.backend {
        LlmBackend::Ollama => {
            info!(url = %llm.ollama.base_url, model = %llm.ollama.model, "Using Ollama (local) backend");
            Ok(ResolvedEndpoint {
                base_url: llm.ollama.base_url.clone(),
                model: llm.ollama.model.clone(),
                api_key: "ollama".to_string(), // required by API but ignored
            })
        }
        LlmBackend::Remote => {
            let api_key = std::env::var("LLM_API_KEY").map_err(|_| ServiceError::MissingApiKey)?;
            info!(url = %llm.remote.base_url, model = %llm.remote.model, "Using remote API backend");
            Ok(ResolvedEndpoint {
                base_url: llm.remote.base_url.clone(),
                model: llm.remote.model.clone(),
                api_key,
            })
        }
        LlmBackend::Disabled => Err(ServiceError::Disabled),
    }
}

/// OpenAI-compatible chat-completions client shared by extraction and classification.
#[derive(Debug, Clone)]
pub struct LlmClient {
    client: Client,
    endpoint: ResolvedEndpoint,
    backend: LlmBackend,
}

impl LlmClient {
    /// `Ok(None)` when the backend is disabled.
    pub fn from_config(llm: &LlmSection) -> Result<Option<Self>, ServiceError> {
        let endpoint = match resolve_endpoint(llm) {
            Ok(endpoint) => endpoint,
            Err(ServiceError::Disabled) => return Ok(None),
            Err(e) => return Err(e),
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()?;
        Ok(Some(Self {
            client,
            endpoint,
            backend: llm.backend,
        }))
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    /// Check if a local Ollama server is reachable. Remote backends are assumed up.
    pub async fn health_check(&self) -> bool {
        if self.backend != LlmBackend::Ollama {
            return true;
        }
        // Ollama's health endpoint is at the root (not under /v1)
        let health_url = self.endpoint.base_url.trim_end_matches('/').trim_end_matches("/v1");

        match self
            .client
            .get(health_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "Ollama server returned non-OK status");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ollama server not reachable");
                false
            }
        }
    }

    /// Send a system + user prompt and decode the JSON object in the reply.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: String,
    ) -> Result<T, ServiceError> {
        let request = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt,
                },
            ],
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status { status, body });
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(ServiceError::EmptyResponse)?;

        let json_str = extract_json_object(content)?;
        Ok(serde_json::from_str(json_str)?)
    }
}

/// Extract the outermost JSON object from a reply that may carry markdown
/// fences or reasoning text around it.
pub(crate) fn extract_json_object(s: &str) -> Result<&str, ServiceError> {
    let start = s
        .find('{')
        .ok_or_else(|| ServiceError::MalformedJson("no '{' found".to_string()))?;
    let end = s
        .rfind('}')
        .ok_or_else(|| ServiceError::MalformedJson("no '}' found".to_string()))?;
    if end <= start {
        return Err(ServiceError::MalformedJson("unbalanced braces".to_string()));
    }
    Ok(&s[start..=end])
}
