//! Completion gateway for the issuepilot agent.
//!
//! Pure HTTP client for an OpenAI-compatible `chat/completions` endpoint,
//! plus the helpers the orchestration loop uses to read its answers.

mod client;
mod error;
mod extract;
mod types;

pub use client::{CompletionClient, CompletionGateway};
pub use error::{LlmError, Result};
pub use extract::first_function_call;
pub use types::{
    ChatMessage, ChatResponse, Choice, ChoiceMessage, FunctionCall, Role, ToolCall, ToolDefinition,
};
