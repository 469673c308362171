use async_trait::async_trait;
use courier_core::config::BackendConfig;
use courier_core::types::{BrainReply, ChatMessage};
use courier_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, status_error, transport_error, truncate_at_char_boundary};
use crate::Provider;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(cfg: &BackendConfig) -> Self {
        let api_base = cfg
            .api_base
            .as_deref()
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(
                cfg.proxy.as_deref(),
                &api_base,
                Duration::from_secs(cfg.timeout_secs),
            ),
            api_key: cfg.api_key.clone(),
            api_base,
            model: Self::normalize_model(&cfg.model).to_string(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }

    /// Split out the system prompt; Anthropic takes it as a top-level field
    /// and only accepts alternating `user`/`assistant` turns starting with `user`.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_text: Option<String> = None;
        let mut turns: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    system_text = Some(match system_text {
                        Some(existing) => format!("{}\n\n{}", existing, msg.content),
                        None => msg.content.clone(),
                    });
                }
                "assistant" => turns.push(json!({"role": "assistant", "content": msg.content})),
                _ => turns.push(json!({"role": "user", "content": msg.content})),
            }
        }

        if turns.first().and_then(|t| t["role"].as_str()) != Some("user") {
            turns.insert(0, json!({"role": "user", "content": "(continue)"}));
        }

        (system_text, Self::merge_consecutive_roles(turns))
    }

    fn merge_consecutive_roles(messages: Vec<Value>) -> Vec<Value> {
        let mut result: Vec<Value> = Vec::new();

        for msg in messages {
            if let Some(last) = result.last_mut() {
                if last["role"] == msg["role"] {
                    let merged = format!(
                        "{}\n\n{}",
                        last["content"].as_str().unwrap_or(""),
                        msg["content"].as_str().unwrap_or("")
                    );
                    last["content"] = Value::String(merged);
                    continue;
                }
            }
            result.push(msg);
        }

        result
    }

    /// Config may store "anthropic/claude-sonnet-4-20250514"; the API wants the bare name.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("anthropic/").unwrap_or(model)
    }

    async fn send_request(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<AnthropicResponse> {
        let url = format!("{}/messages", self.api_base);
        let (system, turns) = Self::convert_messages(messages);

        let mut request = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
            "messages": turns,
        });
        if let Some(sys) = system {
            request["system"] = Value::String(sys);
        }

        info!(url = %url, model = %self.model, messages_count = messages.len(), "Calling Anthropic API");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.endpoint(), e))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| transport_error(&self.endpoint(), e))?;

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Anthropic API error");
            return Err(status_error(&self.endpoint(), status, &raw_body));
        }

        debug!(body_len = raw_body.len(), "Anthropic raw response");
        parse_response(&raw_body)
    }
}

fn parse_response(raw_body: &str) -> Result<AnthropicResponse> {
    serde_json::from_str(raw_body).map_err(|e| {
        let end = truncate_at_char_boundary(raw_body, 500);
        Error::Provider(format!(
            "Failed to parse Anthropic response: {}. Body: {}",
            e,
            &raw_body[..end]
        ))
    })
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl AnthropicResponse {
    fn into_reply(self) -> BrainReply {
        let mut text_parts: Vec<&str> = Vec::new();
        let mut thinking_parts: Vec<&str> = Vec::new();
        for block in &self.content {
            match block.block_type.as_str() {
                "text" => text_parts.extend(block.text.as_deref().filter(|t| !t.is_empty())),
                "thinking" => thinking_parts.extend(block.thinking.as_deref()),
                _ => {}
            }
        }

        info!(
            stop_reason = %self.stop_reason.as_deref().unwrap_or("end_turn"),
            input_tokens = self.usage.as_ref().and_then(|u| u.input_tokens).unwrap_or(0),
            output_tokens = self.usage.as_ref().and_then(|u| u.output_tokens).unwrap_or(0),
            "Anthropic response parsed"
        );

        BrainReply {
            content: text_parts.join("\n"),
            reasoning: if thinking_parts.is_empty() {
                None
            } else {
                Some(thinking_parts.join("\n"))
            },
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<BrainReply> {
        Ok(self.send_request(messages, self.max_tokens).await?.into_reply())
    }

    fn endpoint(&self) -> String {
        format!("{}#{}", self.api_base, self.model)
    }

    async fn probe(&self) -> Result<()> {
        self.send_request(&[ChatMessage::user("ping")], 1).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_messages_system_extraction() {
        let messages = vec![
            ChatMessage::system("You are Coder."),
            ChatMessage::user("[mail from User] hi"),
            ChatMessage::assistant("ACTION: send_message"),
        ];
        let (system, turns) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are Coder."));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["role"], "assistant");
    }

    #[test]
    fn test_merge_consecutive_roles() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::feedback("search", "look", "ok"),
        ];
        let (_, turns) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(turns.len(), 1);
        assert!(turns[0]["content"].as_str().unwrap().starts_with("first\n\n"));
    }

    #[test]
    fn test_leading_assistant_gets_user_turn() {
        let (_, turns) = AnthropicProvider::convert_messages(&[ChatMessage::assistant("hello")]);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["role"], "assistant");
    }

    #[test]
    fn test_normalize_model() {
        assert_eq!(
            AnthropicProvider::normalize_model("anthropic/claude-sonnet-4-20250514"),
            "claude-sonnet-4-20250514"
        );
        assert_eq!(AnthropicProvider::normalize_model("claude-3-5-haiku"), "claude-3-5-haiku");
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "ACTION: finish_task"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }"#;
        let reply = parse_response(body).unwrap().into_reply();
        assert_eq!(reply.content, "ACTION: finish_task");
        assert_eq!(reply.reasoning.as_deref(), Some("hmm"));
    }
}
