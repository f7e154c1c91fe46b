// src/llm/openai.rs
// OpenAI-compatible chat completions client

use super::provider::LlmClient;
use super::types::{ChatResult, FunctionCall, Message, Tool, ToolCall, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Client for any endpoint speaking the `/chat/completions` protocol.
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    context_window: u64,
    http_client: reqwest::Client,
}

impl OpenAiCompatClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: String,
        model: String,
        api_key: String,
        temperature: f32,
        max_tokens: u32,
        context_window: u64,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            api_key,
            temperature,
            max_tokens,
            context_window,
            http_client,
        }
    }

    /// Same endpoint, different model (skill model overrides).
    pub fn with_model(&self, model: String) -> Self {
        Self {
            base_url: self.base_url.clone(),
            model,
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            context_window: self.context_window,
            http_client: self.http_client.clone(),
        }
    }

    fn parse_response(json: &Value) -> Result<ChatResult> {
        let choice = json["choices"]
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("empty choices in chat response"))?;
        let raw_message = &choice["message"];

        let tool_calls = raw_message["tool_calls"].as_array().map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    Some(ToolCall {
                        id: call["id"].as_str()?.to_string(),
                        call_type: call["type"].as_str().unwrap_or("function").to_string(),
                        function: FunctionCall {
                            name: call["function"]["name"].as_str()?.to_string(),
                            arguments: call["function"]["arguments"]
                                .as_str()
                                .unwrap_or("{}")
                                .to_string(),
                        },
                    })
                })
                .collect::<Vec<_>>()
        });

        let message = Message {
            role: "assistant".to_string(),
            content: raw_message["content"].as_str().map(String::from),
            tool_calls: tool_calls.filter(|c| !c.is_empty()),
            tool_call_id: None,
        };

        let usage = Usage::new(
            json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );

        Ok(ChatResult {
            message,
            usage,
            finish_reason: choice["finish_reason"].as_str().map(String::from),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<ChatResult> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(tools) = &tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::to_value(tools)?;
            }
        }

        debug!("Chat request to {} ({} messages)", self.model, body["messages"].as_array().map(|m| m.len()).unwrap_or(0));

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("chat request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("chat API error {}: {}", status, text);
        }

        let json: Value = response.json().await?;
        Self::parse_response(&json)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_final_message() {
        let json: Value = serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let result = OpenAiCompatClient::parse_response(&json).unwrap();
        assert_eq!(result.message.text(), "hello");
        assert_eq!(result.usage.total_tokens, 15);
        assert!(!result.has_tool_calls());
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_tool_call() {
        let json: Value = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "run_python", "arguments": "{\"code\":\"1+1\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        });
        let result = OpenAiCompatClient::parse_response(&json).unwrap();
        assert!(result.has_tool_calls());
        let calls = result.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "run_python");
        assert_eq!(calls[0].id, "call_abc");
    }

    #[test]
    fn test_parse_empty_choices_fails() {
        let json: Value = serde_json::json!({"choices": [], "usage": {}});
        assert!(OpenAiCompatClient::parse_response(&json).is_err());
    }
}
