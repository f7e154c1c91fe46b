// src/error.rs
// Standardized error types for the agent runtime

use thiserror::Error;

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("path violation: {0}")]
    PathViolation(String),

    #[error("size exceeded: {actual} bytes over {limit} byte limit")]
    SizeExceeded { actual: u64, limit: u64 },

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Short machine-readable kind, used in tool results and API payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad_input",
            Self::NotPermitted(_) => "not_permitted",
            Self::NotFound(_) => "not_found",
            Self::PathViolation(_) => "path_violation",
            Self::SizeExceeded { .. } => "size_exceeded",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Db(_) | Self::Io(_) | Self::Json(_) | Self::Http(_) => "internal",
            Self::Embedding(_) => "embedding",
            Self::Llm(_) => "llm",
            Self::Config(_) => "config",
            Self::Internal(_) | Self::Anyhow(_) => "internal",
        }
    }

    /// Whether the error is safe to surface verbatim to an end user.
    /// Internal failures get a generic message instead.
    pub fn user_visible(&self) -> bool {
        matches!(
            self,
            Self::BadInput(_)
                | Self::NotPermitted(_)
                | Self::NotFound(_)
                | Self::SizeExceeded { .. }
                | Self::Timeout(_)
                | Self::Cancelled
        )
    }

    /// Message suitable for a chat reply
    pub fn to_user_string(&self) -> String {
        if self.user_visible() {
            self.to_string()
        } else {
            "an internal error occurred while processing the request".to_string()
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            AgentError::Cancelled
        } else {
            AgentError::Internal(err.to_string())
        }
    }
}

impl From<String> for AgentError {
    fn from(s: String) -> Self {
        AgentError::Internal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(AgentError::BadInput("x".into()).kind(), "bad_input");
        assert_eq!(
            AgentError::PathViolation("x".into()).kind(),
            "path_violation"
        );
        assert_eq!(
            AgentError::SizeExceeded {
                actual: 2,
                limit: 1
            }
            .kind(),
            "size_exceeded"
        );
        assert_eq!(AgentError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_internal_errors_not_user_visible() {
        let err = AgentError::Internal("secret detail".into());
        assert!(!err.user_visible());
        assert!(!err.to_user_string().contains("secret"));
    }

    #[test]
    fn test_user_visible_message_passthrough() {
        let err = AgentError::NotPermitted("command 'rm' is not whitelisted".into());
        assert!(err.to_user_string().contains("rm"));
    }
}
