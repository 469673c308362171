use async_trait::async_trait;
use courier_core::config::BackendConfig;
use courier_core::types::{BrainReply, ChatMessage};
use courier_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, status_error, transport_error, truncate_at_char_boundary};
use crate::Provider;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Any server speaking the OpenAI chat-completions protocol (OpenAI, vLLM,
/// DeepSeek, OpenRouter, llama.cpp ...).
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(cfg: &BackendConfig) -> Self {
        let api_base = cfg
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let client = build_http_client(
            cfg.proxy.as_deref(),
            &api_base,
            Duration::from_secs(cfg.timeout_secs),
        );
        Self {
            client,
            api_key: cfg.api_key.clone(),
            api_base,
            model: cfg
                .model
                .strip_prefix("openai/")
                .unwrap_or(&cfg.model)
                .to_string(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }

    async fn send_request(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);

        let request = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(ApiMessage::from).collect(),
            max_tokens,
            temperature: self.temperature,
        };

        info!(url = %url, model = %self.model, messages_count = messages.len(), "Calling LLM");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&self.endpoint(), e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| transport_error(&self.endpoint(), e))?;

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "LLM API error");
            return Err(status_error(&self.endpoint(), status, &raw_body));
        }

        {
            let end = truncate_at_char_boundary(&raw_body, 500);
            debug!(body_len = raw_body.len(), preview = %&raw_body[..end], "LLM raw response");
        }

        parse_response(&raw_body)
    }
}

fn parse_response(raw_body: &str) -> Result<ChatResponse> {
    serde_json::from_str(raw_body).map_err(|e| {
        let end = truncate_at_char_boundary(raw_body, 500);
        Error::Provider(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for ApiMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        Self {
            role: &m.role,
            content: &m.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ChatResponse {
    fn into_reply(self) -> Result<BrainReply> {
        let usage = self.usage.unwrap_or(Value::Null);
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;
        info!(
            finish_reason = %choice.finish_reason.as_deref().unwrap_or("stop"),
            usage = %usage,
            "LLM response parsed"
        );
        Ok(BrainReply {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content,
        })
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<BrainReply> {
        self.send_request(messages, self.max_tokens).await?.into_reply()
    }

    fn endpoint(&self) -> String {
        format!("{}#{}", self.api_base, self.model)
    }

    async fn probe(&self) -> Result<()> {
        self.send_request(&[ChatMessage::user("ping")], 1).await.map(|_| ())
    }
}
