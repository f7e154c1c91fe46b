// src/agent/skills.rs
// Skill activation protocol: injected messages and execution-context
// modifiers returned by the activate_skill tool

use serde::{Deserialize, Serialize};

/// Whether an injected message is shown to the user or only sent to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageVisibility {
    Visible,
    Hidden,
}

/// One message a skill injects into the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMessage {
    /// metadata | instruction | permissions
    #[serde(rename = "type")]
    pub message_type: String,
    pub content: serde_json::Value,
    pub visibility: MessageVisibility,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

impl SkillMessage {
    /// Message content as conversation text
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Execution-context modifications requested by a skill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextModifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub disable_model_invocation: bool,
}

impl ContextModifier {
    pub fn is_empty(&self) -> bool {
        self.allowed_tools.is_none() && self.model.is_none() && !self.disable_model_invocation
    }
}

/// Full result of a skill activation, parsed from the tool observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillActivationResult {
    pub skill_name: String,
    #[serde(default)]
    pub messages: Vec<SkillMessage>,
    #[serde(default)]
    pub context_modifier: ContextModifier,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

impl SkillActivationResult {
    /// Parse the observation emitted by the activate_skill tool.
    pub fn parse(observation: &str) -> Option<Self> {
        serde_json::from_str(observation).ok()
    }
}
