use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

/// Raised while turning a model-requested function call into a typed invocation.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown function call: {0}")]
    UnknownTool(String),

    #[error("malformed arguments for {tool}: {reason}")]
    MalformedArguments { tool: String, reason: String },
}
