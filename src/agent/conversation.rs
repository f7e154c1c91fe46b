// src/agent/conversation.rs
// Per-conversation state and the registry that serialises turns

use crate::agent::skills::ContextModifier;
use crate::llm::Message;
use crate::memory::MemoryFlush;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Skill context active for the remainder of a turn
#[derive(Debug, Clone, Default)]
pub struct SkillContext {
    pub skill_name: String,
    pub allowed_tools: Option<Vec<String>>,
    pub model: Option<String>,
    pub disable_model_invocation: bool,
}

impl SkillContext {
    pub fn from_modifier(skill_name: &str, modifier: &ContextModifier) -> Self {
        Self {
            skill_name: skill_name.to_string(),
            allowed_tools: modifier.allowed_tools.clone(),
            model: modifier.model.clone(),
            disable_model_invocation: modifier.disable_model_invocation,
        }
    }
}

/// State of one conversation. Lives in memory for the process lifetime,
/// dies on explicit reset.
pub struct ConversationState {
    pub conversation_id: String,
    /// Append-only from the caller's view
    pub messages: Vec<Message>,
    /// Monotone non-decreasing until a successful compaction resets it
    pub session_tokens: u64,
    pub compaction_count: u64,
    pub flush: MemoryFlush,
    pub active_skill: Option<SkillContext>,
}

impl ConversationState {
    pub fn new(conversation_id: String, flush: MemoryFlush) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            session_tokens: 0,
            compaction_count: 0,
            flush,
            active_skill: None,
        }
    }
}

/// Registry of conversations. Each entry is behind its own async mutex;
/// holding it for the duration of a turn serialises turns per id while
/// leaving other conversations free to run in parallel.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the state handle for a conversation id.
    pub async fn get_or_create<F>(
        &self,
        conversation_id: &str,
        make_flush: F,
    ) -> Arc<Mutex<ConversationState>>
    where
        F: FnOnce() -> MemoryFlush,
    {
        let mut map = self.conversations.lock().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationState::new(
                    conversation_id.to_string(),
                    make_flush(),
                )))
            })
            .clone()
    }

    /// Drop a conversation entirely. Returns whether it existed.
    pub async fn reset(&self, conversation_id: &str) -> bool {
        self.conversations
            .lock()
            .await
            .remove(conversation_id)
            .is_some()
    }

    pub async fn len(&self) -> usize {
        self.conversations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
