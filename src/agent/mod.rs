// src/agent/mod.rs
// Agent loop (C6): per-conversation state machine driving the LLM tool-use
// loop, threading results through the file store and the compactor

pub mod conversation;
pub mod skills;


use crate::config::{FlushConfig, LlmConfig};
use crate::error::AgentError;
use crate::filestore::{FileRef, FileStore};
use crate::llm::{LlmClient, Message, Tool};
use crate::memory::{MemoryExtractor, MemoryFlush};
use crate::tools::ToolRunner;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use conversation::{ConversationRegistry, ConversationState, SkillContext};
pub use skills::{ContextModifier, MessageVisibility, SkillActivationResult, SkillMessage};

/// Factory for model-override clients (skill context modifiers)
pub type ModelFactory = Arc<dyn Fn(&str) -> Arc<dyn LlmClient> + Send + Sync>;

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a business-analysis assistant for non-technical users. You detect \
metric anomalies, attribute changes to their causes, and produce reports \
and charts. Use the available tools for data work; keep answers grounded \
in retrieved facts. Important long-term information is persisted to memory \
automatically.";

/// Result of one user turn
#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnResult {
    pub conversation_id: String,
    pub response: String,
    pub success: bool,
    pub tokens_used: u64,
    pub session_tokens: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The conversational agent. One instance serves every conversation;
/// per-conversation mutexes serialise turns within an id.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    model_factory: Option<ModelFactory>,
    tools: Arc<ToolRunner>,
    store: Arc<FileStore>,
    conversations: ConversationRegistry,
    flush_config: FlushConfig,
    llm_config: LlmConfig,
    extractor_client: Option<Arc<dyn LlmClient>>,
    system_prompt: String,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRunner>,
        store: Arc<FileStore>,
        flush_config: FlushConfig,
        llm_config: LlmConfig,
        extractor_client: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            llm,
            model_factory: None,
            tools,
            store,
            conversations: ConversationRegistry::new(),
            flush_config,
            llm_config,
            extractor_client,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = Some(factory);
        self
    }

    fn make_flush(&self) -> MemoryFlush {
        let extractor = MemoryExtractor::new(
            self.extractor_client.clone(),
            Duration::from_secs(self.flush_config.llm_timeout_secs),
        );
        MemoryFlush::new(self.flush_config.clone(), extractor)
    }

    fn client_for(&self, skill: &Option<SkillContext>) -> Arc<dyn LlmClient> {
        if let (Some(context), Some(factory)) = (skill, &self.model_factory) {
            if let Some(model) = &context.model {
                return factory(model);
            }
        }
        self.llm.clone()
    }

    fn tools_for(&self, skill: &Option<SkillContext>) -> Vec<Tool> {
        let mut definitions = self.tools.definitions();
        if let Some(context) = skill {
            if let Some(allowed) = &context.allowed_tools {
                definitions.retain(|t| allowed.iter().any(|a| a == t.name()));
            }
        }
        definitions
    }

    /// Handle one user turn. Exactly one turn executes at a time per
    /// conversation id; concurrent callers queue on the state mutex.
    pub async fn handle_message(
        &self,
        message: &str,
        conversation_id: Option<String>,
    ) -> TurnResult {
        let start = Instant::now();
        let conversation_id = conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("conv_{}", uuid::Uuid::new_v4().simple()));

        let handle = self
            .conversations
            .get_or_create(&conversation_id, || self.make_flush())
            .await;
        let mut state = handle.lock().await;

        state.messages.push(Message::user(message));
        state.flush.add_message("user", message);
        state.active_skill = None;

        let mut turn_tokens: u64 = 0;
        let mut artifact_refs: Vec<FileRef> = Vec::new();
        let mut visible_notices: Vec<String> = Vec::new();
        let mut reply: Option<String> = None;
        let mut turn_error: Option<AgentError> = None;

        for round in 0..=self.llm_config.max_tool_rounds {
            if round == self.llm_config.max_tool_rounds {
                turn_error = Some(AgentError::BadInput(format!(
                    "tool-call limit of {} rounds reached",
                    self.llm_config.max_tool_rounds
                )));
                break;
            }

            let client = self.client_for(&state.active_skill);
            let tools = self.tools_for(&state.active_skill);
            let mut chat_messages = Vec::with_capacity(state.messages.len() + 1);
            chat_messages.push(Message::system(&self.system_prompt));
            chat_messages.extend(state.messages.iter().cloned());

            let result = match client.chat(chat_messages, Some(tools)).await {
                Ok(r) => r,
                Err(e) => {
                    turn_error = Some(AgentError::Llm(e.to_string()));
                    break;
                }
            };
            turn_tokens += result.usage.total_tokens;

            if !result.has_tool_calls() {
                reply = Some(result.message.text().to_string());
                break;
            }

            let calls = result.message.tool_calls.clone().unwrap_or_default();
            state.messages.push(result.message);

            let mut disable_model = false;
            for call in &calls {
                let tool_result = self.tools.execute_call(call, &conversation_id).await;
                debug!(
                    "Tool {} -> success={} ({}ms)",
                    tool_result.tool_name, tool_result.success, tool_result.duration_ms
                );

                if call.function.name == "activate_skill" && tool_result.success {
                    if let Some(activation) = SkillActivationResult::parse(&tool_result.observation)
                    {
                        if activation.success {
                            for skill_message in &activation.messages {
                                let text = skill_message.content_text();
                                if skill_message.visibility == MessageVisibility::Visible {
                                    visible_notices.push(text.clone());
                                }
                                state.messages.push(Message {
                                    role: skill_message.role.clone(),
                                    content: Some(text),
                                    tool_calls: None,
                                    tool_call_id: None,
                                });
                            }
                            let context = SkillContext::from_modifier(
                                &activation.skill_name,
                                &activation.context_modifier,
                            );
                            disable_model |= context.disable_model_invocation;
                            info!("Skill '{}' activated", activation.skill_name);
                            state.active_skill = Some(context);
                        } else {
                            warn!(
                                "Skill activation failed: {}",
                                activation.error.as_deref().unwrap_or("unknown")
                            );
                        }
                    }
                }

                if let Some(artifact_id) = &tool_result.artifact_id {
                    if let Some(file_ref) = parse_artifact_ref(artifact_id) {
                        artifact_refs.push(file_ref);
                    }
                }

                state
                    .messages
                    .push(Message::tool_result(&call.id, tool_result.observation.clone()));
            }

            if disable_model {
                // The skill asked for no further model invocation this turn.
                let text = if visible_notices.is_empty() {
                    "skill activated".to_string()
                } else {
                    visible_notices.join("\n")
                };
                reply = Some(text);
                visible_notices.clear();
                break;
            }
        }

        let (response, success, error) = match (reply, turn_error) {
            (Some(text), _) => {
                let response = if visible_notices.is_empty() {
                    text
                } else {
                    format!("{}\n\n{}", visible_notices.join("\n"), text)
                };
                (response, true, None)
            }
            (None, Some(e)) => (
                format!("sorry, something went wrong: {}", e.to_user_string()),
                false,
                Some(e.to_string()),
            ),
            (None, None) => (
                "sorry, no response was produced".to_string(),
                false,
                Some("empty response".to_string()),
            ),
        };

        if success {
            state.messages.push(Message::assistant(Some(response.clone())));
            state.flush.add_message("assistant", &response);
        }

        state.session_tokens += turn_tokens;
        self.maybe_flush(&mut state, &artifact_refs).await;
        self.checkpoint(&state, "latest").await;

        let session_tokens = state.session_tokens;
        state.active_skill = None;
        drop(state);

        TurnResult {
            conversation_id,
            response,
            success,
            tokens_used: turn_tokens,
            session_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        }
    }

    /// Silent compaction round after the turn. Outcomes are never surfaced
    /// to the user; failures are logged and swallowed.
    async fn maybe_flush(&self, state: &mut ConversationState, artifact_refs: &[FileRef]) {
        if !self.flush_config.enabled {
            return;
        }

        // Context-window gate: only consider flushing once the session eats
        // into the window's reserve. An unknown window (0) skips the gate.
        let window = self.llm_config.context_window_tokens;
        if window > 0 {
            let gate = window
                .saturating_sub(self.flush_config.reserve_tokens_floor)
                .saturating_sub(self.flush_config.soft_threshold_tokens);
            if state.session_tokens < gate {
                return;
            }
        }

        let tokens = state.session_tokens;
        let count = state.compaction_count;
        let outcome = state
            .flush
            .check_and_flush(&self.store, tokens, count, false, artifact_refs)
            .await;

        if let Some(error) = &outcome.error {
            warn!("Silent flush failed: {}", error);
        }
        if outcome.flushed {
            info!(
                "Compaction {}: {} memories written ({})",
                count,
                outcome.memories_written,
                outcome.reason.as_deref().unwrap_or("")
            );
            state.compaction_count += 1;
            state.session_tokens = 0;
        }
    }

    /// Lazy conversation checkpoint into the checkpoint category, stored
    /// under `temp/checkpoints/<conversation>/<name>.json`. Best-effort: a
    /// failed checkpoint never fails the turn.
    async fn checkpoint(&self, state: &ConversationState, name: &str) {
        let Some(bytes) = snapshot_bytes(state) else {
            return;
        };
        if let Err(e) = self
            .store
            .store_checkpoint(&state.conversation_id, name, &bytes)
            .await
        {
            warn!("Checkpoint for {} failed: {}", state.conversation_id, e);
        }
    }

    /// Write a named checkpoint of a conversation's current state. Multiple
    /// names coexist per conversation; re-using a name replaces it.
    pub async fn save_checkpoint(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> crate::error::Result<FileRef> {
        let handle = self
            .conversations
            .get_or_create(conversation_id, || self.make_flush())
            .await;
        let state = handle.lock().await;
        let bytes = snapshot_bytes(&state).ok_or_else(|| {
            AgentError::Internal("conversation state failed to serialize".to_string())
        })?;
        self.store
            .store_checkpoint(conversation_id, name, &bytes)
            .await
    }

    /// Checkpoint names recorded for a conversation, newest first.
    pub async fn list_checkpoints(
        &self,
        conversation_id: &str,
    ) -> crate::error::Result<Vec<String>> {
        self.store.list_checkpoints(conversation_id).await
    }

    /// Force a compaction for a conversation (maintenance surface).
    pub async fn force_flush(&self, conversation_id: &str) -> crate::memory::flush::FlushOutcome {
        let handle = self
            .conversations
            .get_or_create(conversation_id, || self.make_flush())
            .await;
        let mut state = handle.lock().await;
        let tokens = state.session_tokens;
        let count = state.compaction_count;
        let outcome = state
            .flush
            .check_and_flush(&self.store, tokens, count, true, &[])
            .await;
        if outcome.flushed {
            state.compaction_count += 1;
            state.session_tokens = 0;
        }
        outcome
    }

    /// Drop a conversation's state entirely.
    pub async fn reset_conversation(&self, conversation_id: &str) -> bool {
        self.conversations.reset(conversation_id).await
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }
}

/// Serialized conversation snapshot for checkpoint storage.
fn snapshot_bytes(state: &ConversationState) -> Option<Vec<u8>> {
    serde_json::to_vec(&serde_json::json!({
        "conversation_id": state.conversation_id,
        "messages": state.messages,
        "session_tokens": state.session_tokens,
        "compaction_count": state.compaction_count,
    }))
    .ok()
}

/// Minimal FileRef reconstructed from a `category:file_id` string; enough
/// for back-reference blocks in flush markdown.
fn parse_artifact_ref(ref_string: &str) -> Option<FileRef> {
    let (category, file_id) = FileRef::parse_ref_string(ref_string).ok()?;
    Some(FileRef {
        file_id,
        category,
        session_id: None,
        size_bytes: 0,
        hash: String::new(),
        mime_type: String::new(),
        created_at: Utc::now(),
        metadata: serde_json::Value::Null,
    })
}
