// src/tools/types.rs
// Tool execution results, output levels, and cache policy

use crate::error::AgentError;
use crate::utils::truncate_chars;
use serde::{Deserialize, Serialize};

/// How much of a tool's output reaches the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Brief,
    #[default]
    Standard,
    Full,
}

impl OutputLevel {
    /// Accepts brief/concise, standard, full/detailed; anything else is
    /// standard.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "brief" | "concise" => Self::Brief,
            "full" | "detailed" => Self::Full,
            _ => Self::Standard,
        }
    }

    /// Character budget for the observation; `None` is unbounded
    pub fn char_budget(&self) -> Option<usize> {
        match self {
            Self::Brief => Some(200),
            Self::Standard => Some(2000),
            Self::Full => None,
        }
    }

    pub fn apply(&self, text: &str) -> String {
        match self.char_budget() {
            Some(budget) => truncate_chars(text, budget),
            None => text.to_string(),
        }
    }
}

/// Per-call caching behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    #[default]
    NoCache,
    MemoizeByInput,
}

/// Uniform result of one tool invocation. Errors never escape the tool
/// layer as exceptions; they become a failed result the model can read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub success: bool,
    /// Text shown to the model (and, at some levels, the user)
    pub observation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
    pub output_level: OutputLevel,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolExecutionResult {
    pub fn ok(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        observation: String,
        output_level: OutputLevel,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: true,
            observation: output_level.apply(&observation),
            artifact_id: None,
            data_size_bytes: None,
            data_hash: None,
            output_level,
            duration_ms: 0,
            error_kind: None,
        }
    }

    pub fn failed(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: &AgentError,
        output_level: OutputLevel,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: false,
            observation: error.to_user_string(),
            artifact_id: None,
            data_size_bytes: None,
            data_hash: None,
            output_level,
            duration_ms: 0,
            error_kind: Some(error.kind().to_string()),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
