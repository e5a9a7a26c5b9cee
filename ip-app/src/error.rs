use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use ip_llm::LlmError;
use ip_tools::{DispatchError, ToolError};
use thiserror::Error;

/// Every way a request to the agent endpoint can fail. None of them are retried.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("malformed request body: {0}")]
    MalformedRequestBody(String),

    #[error("completion gateway failed: {0}")]
    Gateway(#[from] LlmError),

    #[error("tool execution failed: {0}")]
    ToolExecution(#[from] ToolError),

    #[error("unknown function call: {0}")]
    UnknownFunctionCall(String),

    #[error("malformed arguments for {tool}: {reason}")]
    MalformedArguments { tool: String, reason: String },

    #[error("response stream closed by client")]
    StreamClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for AgentError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownTool(name) => Self::UnknownFunctionCall(name),
            DispatchError::MalformedArguments { tool, reason } => {
                Self::MalformedArguments { tool, reason }
            }
        }
    }
}

impl AgentError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid(_) | Self::MissingCredentials(_) => StatusCode::UNAUTHORIZED,
            Self::MalformedRequestBody(_) | Self::MalformedArguments { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Gateway(_)
            | Self::ToolExecution(_)
            | Self::UnknownFunctionCall(_)
            | Self::StreamClosed
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable identifier used in logs and in `copilot_errors` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::MissingCredentials(_) => "missing_credentials",
            Self::MalformedRequestBody(_) => "malformed_request_body",
            Self::Gateway(_) => "gateway_error",
            Self::ToolExecution(_) => "tool_execution_error",
            Self::UnknownFunctionCall(_) => "unknown_function_call",
            Self::MalformedArguments { .. } => "malformed_arguments",
            Self::StreamClosed => "stream_closed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Short text shown to the caller. Upstream bodies stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::SignatureInvalid(_) | Self::MissingCredentials(_) => "unauthorized",
            Self::MalformedRequestBody(_) => "malformed request body",
            Self::Gateway(_) => "the completion service request failed",
            Self::ToolExecution(_) => "the issue tracker request failed",
            Self::UnknownFunctionCall(_) => "the model requested an unknown tool",
            Self::MalformedArguments { .. } => "the model sent malformed tool arguments",
            Self::StreamClosed => "response stream closed",
            Self::Internal(_) => "internal server error",
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error_code = self.code(), error = %self, "agent request failed");
        } else {
            tracing::warn!(error_code = self.code(), error = %self, "agent request rejected");
        }
        (
            status,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.public_message(),
        )
            .into_response()
    }
}
