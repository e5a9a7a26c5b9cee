//! Per-request construction of the upstream collaborators.
//!
//! The caller's token authenticates both the completion gateway and the
//! issue tracker, so each request gets its own pair bound to it.

use crate::config::IssuePilotConfig;
use crate::error::AgentError;
use crate::request::Credentials;
use anyhow::Result;
use ip_llm::{CompletionClient, CompletionGateway, LlmError};
use ip_tools::{GithubClient, IssueTracker, ToolError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn CompletionGateway>,
    pub tracker: Arc<dyn IssueTracker>,
}

pub trait Backends: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Collaborators, AgentError>;
}

/// Shares two connection pools across requests; only the token varies.
pub struct HttpBackends {
    completion_http: reqwest::Client,
    github_http: reqwest::Client,
    completion_base_url: String,
    model: String,
    github_api_base_url: String,
    user_agent: String,
}

impl HttpBackends {
    pub fn from_config(cfg: &IssuePilotConfig) -> Result<Self> {
        let completion_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.completion.request_timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("build completion http client: {e}"))?;
        let github_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.github.request_timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("build github http client: {e}"))?;
        Ok(Self {
            completion_http,
            github_http,
            completion_base_url: cfg.completion.base_url.clone(),
            model: cfg.completion.model.clone(),
            github_api_base_url: cfg.github.api_base_url.clone(),
            user_agent: cfg.github.user_agent.clone(),
        })
    }
}

impl Backends for HttpBackends {
    fn connect(&self, credentials: &Credentials) -> Result<Collaborators, AgentError> {
        let gateway = CompletionClient::new(
            self.completion_http.clone(),
            &self.completion_base_url,
            &self.model,
            &credentials.token,
            credentials.integration_id.clone(),
        )
        .map_err(|e| match e {
            LlmError::InvalidInput(msg) => AgentError::MissingCredentials(msg),
            other => AgentError::Gateway(other),
        })?;
        let tracker = GithubClient::new(
            self.github_http.clone(),
            &self.github_api_base_url,
            &credentials.token,
            &self.user_agent,
        )
        .map_err(|e| match e {
            ToolError::InvalidArguments(msg) => AgentError::MissingCredentials(msg),
            other => AgentError::ToolExecution(other),
        })?;
        Ok(Collaborators {
            gateway: Arc::new(gateway),
            tracker: Arc::new(tracker),
        })
    }
}
