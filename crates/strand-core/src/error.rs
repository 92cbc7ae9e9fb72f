use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Preparation errors
    #[error("Workflow source not found: {0}")]
    SourceNotFound(String),

    #[error("Template parameters invalid: {0}")]
    TemplateParamsInvalid(String),

    #[error("Graph invalid: {0}")]
    GraphInvalid(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    // Model provider errors
    #[error("Model request failed: {0}")]
    ProviderRequest(String),

    #[error("Model provider rate limited: {0}")]
    ProviderRateLimited(String),

    #[error("Model provider timed out after {timeout_secs}s")]
    ProviderTimeout { timeout_secs: u64 },

    #[error("Model stream error: {0}")]
    ProviderStream(String),

    #[error("Model provider not supported: {0}")]
    UnsupportedProvider(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool-call budget exhausted after {limit} calls")]
    ToolBudgetExceeded { limit: u32 },

    // Other node errors
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Loop {node_id} hit its limit of {max_iterations} iterations")]
    LoopLimitExceeded { node_id: String, max_iterations: u32 },

    #[error("Node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Middleware errors
    #[error("Rate limit exceeded for {scope}: {reason}")]
    RateLimitExceeded { scope: String, reason: String },

    #[error("Context validation failed: {0}")]
    ValidationFailed(String),

    // Result processing errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StrandError>;

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceNotFound,
    TemplateParamsInvalid,
    GraphInvalid,
    DependencyUnavailable,
    ProviderError,
    ProviderRateLimited,
    ProviderTimeout,
    ToolNotFound,
    ToolFailed,
    ToolTimeout,
    ToolBudgetExceeded,
    RetrievalUnavailable,
    LoopLimitExceeded,
    NodeFailed,
    Cancelled,
    RateLimitExceeded,
    ValidationFailed,
    PersistenceFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceNotFound => "source_not_found",
            Self::TemplateParamsInvalid => "template_params_invalid",
            Self::GraphInvalid => "graph_invalid",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::ProviderError => "provider_error",
            Self::ProviderRateLimited => "provider_rate_limited",
            Self::ProviderTimeout => "provider_timeout",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolFailed => "tool_failed",
            Self::ToolTimeout => "tool_timeout",
            Self::ToolBudgetExceeded => "tool_budget_exceeded",
            Self::RetrievalUnavailable => "retrieval_unavailable",
            Self::LoopLimitExceeded => "loop_limit_exceeded",
            Self::NodeFailed => "node_failed",
            Self::Cancelled => "cancelled",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ValidationFailed => "validation_failed",
            Self::PersistenceFailed => "persistence_failed",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage at which an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preparation,
    Runtime,
    Processing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparation => f.write_str("preparation"),
            Self::Runtime => f.write_str("runtime"),
            Self::Processing => f.write_str("processing"),
        }
    }
}

impl StrandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceNotFound(_) => ErrorKind::SourceNotFound,
            Self::TemplateParamsInvalid(_) => ErrorKind::TemplateParamsInvalid,
            Self::GraphInvalid(_) => ErrorKind::GraphInvalid,
            Self::DependencyUnavailable(_) | Self::UnsupportedProvider(_) => {
                ErrorKind::DependencyUnavailable
            }
            Self::ProviderRequest(_) | Self::ProviderStream(_) => ErrorKind::ProviderError,
            Self::ProviderRateLimited(_) => ErrorKind::ProviderRateLimited,
            Self::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolExecution { .. } => ErrorKind::ToolFailed,
            Self::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            Self::ToolBudgetExceeded { .. } => ErrorKind::ToolBudgetExceeded,
            Self::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            Self::LoopLimitExceeded { .. } => ErrorKind::LoopLimitExceeded,
            Self::NodeFailed { .. } => ErrorKind::NodeFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::Persistence(_) | Self::Database(_) => ErrorKind::PersistenceFailed,
            Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stage this error belongs to when it escapes a run.
    pub fn stage(&self) -> Stage {
        match self.kind() {
            ErrorKind::SourceNotFound
            | ErrorKind::TemplateParamsInvalid
            | ErrorKind::GraphInvalid
            | ErrorKind::DependencyUnavailable => Stage::Preparation,
            ErrorKind::PersistenceFailed => Stage::Processing,
            _ => Stage::Runtime,
        }
    }

    /// Whether the retry middleware may re-invoke after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderTimeout { .. } | Self::ProviderRateLimited(_) => true,
            Self::ProviderRequest(msg) => {
                msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            Self::ProviderStream(_) => true,
            _ => false,
        }
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::SourceNotFound => "The requested workflow does not exist.".into(),
            ErrorKind::TemplateParamsInvalid => {
                "The workflow template was given invalid parameters.".into()
            }
            ErrorKind::GraphInvalid => "The workflow is not valid and cannot be run.".into(),
            ErrorKind::DependencyUnavailable => {
                "A service the workflow depends on is not available right now.".into()
            }
            ErrorKind::ProviderError | ErrorKind::ProviderTimeout => {
                "The language model did not respond successfully. Please try again.".into()
            }
            ErrorKind::ProviderRateLimited | ErrorKind::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            ErrorKind::ToolNotFound | ErrorKind::ToolFailed | ErrorKind::ToolTimeout => {
                "A tool used by the workflow failed.".into()
            }
            ErrorKind::ToolBudgetExceeded => {
                "The workflow used up its allowance of tool calls.".into()
            }
            ErrorKind::RetrievalUnavailable => "Document search is unavailable right now.".into(),
            ErrorKind::LoopLimitExceeded => "The workflow repeated a step too many times.".into(),
            ErrorKind::Cancelled => "The request was cancelled before it finished.".into(),
            ErrorKind::ValidationFailed => "The workflow produced an inconsistent state.".into(),
            ErrorKind::PersistenceFailed => "The answer could not be saved.".into(),
            ErrorKind::NodeFailed | ErrorKind::Internal => {
                "Something went wrong while running the workflow.".into()
            }
        }
    }

    /// Snapshot of this error for result and event payloads.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            stage: self.stage(),
            message: self.to_string(),
            user_message: self.user_message(),
        }
    }
}

/// Serializable description of a run error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub stage: Stage,
    /// Internal, developer-facing message.
    pub message: String,
    /// Human-readable message for end users.
    pub user_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preparation_errors_map_to_preparation_stage() {
        assert_eq!(StrandError::SourceNotFound("x".into()).stage(), Stage::Preparation);
        assert_eq!(StrandError::GraphInvalid("x".into()).stage(), Stage::Preparation);
        assert_eq!(
            StrandError::UnsupportedProvider("x".into()).stage(),
            Stage::Preparation
        );
        assert_eq!(StrandError::Cancelled.stage(), Stage::Runtime);
        assert_eq!(StrandError::Persistence("x".into()).stage(), Stage::Processing);
    }

    #[test]
    fn only_provider_transients_are_retryable() {
        assert!(StrandError::ProviderTimeout { timeout_secs: 5 }.is_retryable());
        assert!(StrandError::ProviderRateLimited("429".into()).is_retryable());
        assert!(StrandError::ProviderRequest("HTTP 503: busy".into()).is_retryable());
        assert!(!StrandError::ProviderRequest("HTTP 400: bad".into()).is_retryable());
        assert!(!StrandError::ToolBudgetExceeded { limit: 3 }.is_retryable());
        assert!(!StrandError::GraphInvalid("cycle".into()).is_retryable());
        assert!(!StrandError::Cancelled.is_retryable());
    }

    #[test]
    fn user_message_differs_from_kind() {
        let err = StrandError::ToolBudgetExceeded { limit: 2 };
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::ToolBudgetExceeded);
        assert_ne!(report.user_message, report.kind.as_str());
        assert!(report.message.contains('2'));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::LoopLimitExceeded).unwrap();
        assert_eq!(json, "\"loop_limit_exceeded\"");
    }
}
