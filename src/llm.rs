//! Language model client.
//!
//! [`LanguageModel`] is what the query engine and the instruction generator
//! talk to. The only backend is a local Ollama server: `/api/generate` for
//! single prompts and `/api/chat` for system + user conversations. Calls are
//! not retried; a long-running local model is bounded by the configured
//! request timeout instead.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling options. `None` leaves the model's default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of generated tokens.
    #[serde(rename = "num_predict", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete a single prompt.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    /// Reply to a conversation; returns the assistant message content.
    async fn chat(&self, messages: &[ChatMessage], options: &GenerationOptions) -> Result<String>;
}

pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: &'a GenerationOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: &'a GenerationOptions,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

impl OllamaModel {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow!("Ollama request to {} failed: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 && text.contains("not found") {
                bail!(
                    "Ollama model '{}' is not available; run `ollama pull {}`",
                    self.model,
                    self.model
                );
            }
            bail!("Ollama API error {}: {}", status, text);
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Invalid Ollama response from {}: {}", url, e))
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "generate");
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options,
        };
        let response: GenerateResponse = self.post("/api/generate", &request).await?;
        Ok(response.response)
    }

    async fn chat(&self, messages: &[ChatMessage], options: &GenerationOptions) -> Result<String> {
        tracing::debug!(model = %self.model, messages = messages.len(), "chat");
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options,
        };
        let response: ChatResponse = self.post("/api/chat", &request).await?;
        Ok(response.message.content)
    }
}
