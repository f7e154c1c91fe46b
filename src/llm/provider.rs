// src/llm/provider.rs
// LLM client abstraction

use super::types::{ChatResult, Message, Tool};
use anyhow::Result;
use async_trait::async_trait;

/// Trait every chat model binding implements. The runtime consumes this
/// interface only; provider bindings are collaborators.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request
    async fn chat(&self, messages: Vec<Message>, tools: Option<Vec<Tool>>) -> Result<ChatResult>;

    /// Model identifier for logging and overrides
    fn model(&self) -> &str;

    /// Token budget of this model's context window (0 = unknown)
    fn context_window(&self) -> u64 {
        0
    }
}
