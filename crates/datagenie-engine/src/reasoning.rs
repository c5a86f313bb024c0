//! Reasoning service adapter
//!
//! The engine only needs "prompt in, text out". [`HttpReasoningService`]
//! speaks the OpenAI-compatible chat-completions protocol.

use crate::config::ReasoningConfig;
use crate::error::ReasoningError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Send one prompt and return the raw completion text
    async fn complete(&self, prompt: &str) -> Result<String, ReasoningError>;

    fn service_name(&self) -> &'static str {
        "reasoning"
    }
}

const SYSTEM_PROMPT: &str = "You translate analytics questions into a single read-only SQL query. \
Reply with one JSON object and nothing else.";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client with an optional fallback model
pub struct HttpReasoningService {
    endpoint: String,
    model: String,
    fallback_model: Option<String>,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    client: Client,
}

impl HttpReasoningService {
    pub fn new(config: &ReasoningConfig) -> Result<Self, ReasoningError> {
        if config.endpoint.trim().is_empty() {
            return Err(ReasoningError::InvalidConfiguration(
                "reasoning endpoint is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                error!("Failed to create HTTP client: {}", e);
                ReasoningError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            api_key: config.api_key.as_ref().map(|key| key.expose().to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }

    async fn complete_with(&self, model: &str, prompt: &str) -> Result<String, ReasoningError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        debug!("Sending completion request (model {})", model);

        let response = request.send().await.map_err(|e| {
            error!("Reasoning service request failed: {}", e);
            ReasoningError::Request(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Reasoning service returned error {}: {}", status, error_text);
            return Err(ReasoningError::Status(status.as_u16()));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse reasoning service response: {}", e);
            ReasoningError::MalformedResponse(e.to_string())
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ReasoningError::MalformedResponse("no completion content".to_string()))
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn complete(&self, prompt: &str) -> Result<String, ReasoningError> {
        match self.complete_with(&self.model, prompt).await {
            Ok(text) => Ok(text),
            Err(primary) => match self.fallback_model.as_deref() {
                Some(fallback) if fallback != self.model => {
                    warn!(
                        "Primary model {} failed ({}), trying fallback {}",
                        self.model, primary, fallback
                    );
                    self.complete_with(fallback, prompt).await
                }
                _ => Err(primary),
            },
        }
    }

    fn service_name(&self) -> &'static str {
        "chat-completions"
    }
}
