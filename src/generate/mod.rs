//! Firmware source generation.
//!
//! A [`CodeGenerator`] turns one natural-language instruction into the model's
//! raw reply text; [`parser::parse_response`] turns that reply into code and an
//! explanation. [`ChatCompletionsGenerator`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint.

pub mod parser;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::PipelineError;

pub use parser::{GeneratedSource, normalize_code, parse_response};

/// System directive sent with every instruction.
pub const SYSTEM_PROMPT: &str = "You convert English instructions into Arduino sketches. \
Respond ONLY with a valid JSON object with exactly two string keys: \
\"code\" (the complete sketch source, including setup() and loop()) and \
\"explanation\" (a short description of what the sketch does and how to wire it). \
Do not wrap the JSON in markdown and do not add any other text.";

/// Abstraction over the language model call for testability.
/// Real implementation: `ChatCompletionsGenerator`.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Ask the model for a program implementing `instruction`; returns the raw reply.
    async fn generate(&self, instruction: &str) -> Result<String, PipelineError>;
}

/// Connection settings for a chat-completions service.
#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Generator backed by an OpenAI-compatible HTTP API.
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl ChatCompletionsGenerator {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client for language model")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key,
            model: config.model,
            timeout: config.timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn describe(&self, err: &reqwest::Error) -> String {
        if err.is_timeout() {
            format!("request timed out after {}s", self.timeout.as_secs_f64())
        } else if err.is_connect() {
            format!("service unreachable at {}: {}", self.endpoint, err)
        } else {
            err.to_string()
        }
    }
}

#[async_trait]
impl CodeGenerator for ChatCompletionsGenerator {
    async fn generate(&self, instruction: &str) -> Result<String, PipelineError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: instruction,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(endpoint = %self.endpoint, model = %self.model, "requesting generation");
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| PipelineError::Generation(self.describe(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!(
                "service returned {}: {}",
                status,
                text.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("unreadable response: {}", self.describe(&e))))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::Generation("response contained no message content".into()))?;

        info!(chars = content.len(), "generation complete");
        Ok(content)
    }
}
