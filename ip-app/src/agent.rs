//! Tool-calling orchestration loop: completion gateway + issue tools +
//! confirmation dialogs, streamed back through a [`ResponseWriter`].

use crate::dedup::ConfirmationDeduplicator;
use crate::error::AgentError;
use crate::request::AgentRequest;
use crate::stream::ResponseWriter;
use ip_llm::{ChatMessage, CompletionGateway, first_function_call};
use ip_tools::{
    Confirmation, IssueTracker, ToolInvocation, ToolRegistry, create_issue, create_issue_dialog,
    list_issues,
};
use std::time::Instant;

/// Hard cap on gateway calls per request. The last call is made without tools.
pub const MAX_ITERATIONS: usize = 5;

pub const FALLBACK_MESSAGE: &str =
    "Sorry, I wasn't able to finish that request. Please try rephrasing it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The model produced a plain-text answer on the given (1-based) gateway call.
    Answered { gateway_calls: usize },
    /// An accepted confirmation was executed; the gateway was not consulted.
    IssueCreated,
    /// Every iteration ended in a tool call; the fallback message was sent.
    IterationsExhausted,
}

impl Outcome {
    pub fn gateway_calls(&self) -> usize {
        match self {
            Self::Answered { gateway_calls } => *gateway_calls,
            Self::IssueCreated => 0,
            Self::IterationsExhausted => MAX_ITERATIONS,
        }
    }
}

pub struct Agent<'a> {
    registry: &'a ToolRegistry,
    gateway: &'a dyn CompletionGateway,
    tracker: &'a dyn IssueTracker,
    system_prompt: Option<&'a str>,
}

impl<'a> Agent<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        gateway: &'a dyn CompletionGateway,
        tracker: &'a dyn IssueTracker,
    ) -> Self {
        Self {
            registry,
            gateway,
            tracker,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<&'a str>) -> Self {
        self.system_prompt = system_prompt.map(str::trim).filter(|p| !p.is_empty());
        self
    }

    /// Serve one request end to end. A failure after the first unit was
    /// written is reported in-band as an error event before returning it.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn respond(
        &self,
        request: AgentRequest,
        writer: &mut ResponseWriter,
    ) -> Result<Outcome, AgentError> {
        let started = Instant::now();
        let result = self.handle(request, writer).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(
                    ?outcome,
                    gateway_calls = outcome.gateway_calls(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "agent request completed"
                );
            }
            Err(AgentError::StreamClosed) => {
                tracing::warn!("agent response stream closed by client");
            }
            Err(e) => {
                tracing::error!(
                    error_code = e.code(),
                    error = %e,
                    streamed = writer.has_written(),
                    "agent request failed"
                );
                if writer.has_written() {
                    if let Err(write_err) = writer.error(e).await {
                        tracing::warn!(error = %write_err, "failed to write error event");
                    }
                }
            }
        }
        result
    }

    async fn handle(
        &self,
        request: AgentRequest,
        writer: &mut ResponseWriter,
    ) -> Result<Outcome, AgentError> {
        if let Some(confirmation) = request.accepted_confirmation() {
            return self.execute_confirmed(confirmation, writer).await;
        }

        let mut history = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = self.system_prompt {
            history.push(ChatMessage::system(prompt));
        }
        history.extend(request.history());
        self.run_loop(history, writer).await
    }

    async fn execute_confirmed(
        &self,
        confirmation: &Confirmation,
        writer: &mut ResponseWriter,
    ) -> Result<Outcome, AgentError> {
        tracing::info!(
            owner = %confirmation.owner,
            repo = %confirmation.repo,
            "executing accepted confirmation"
        );
        let summary = create_issue(self.tracker, confirmation).await?;
        writer.text(&summary.content).await?;
        writer.done().await?;
        Ok(Outcome::IssueCreated)
    }

    async fn run_loop(
        &self,
        mut history: Vec<ChatMessage>,
        writer: &mut ResponseWriter,
    ) -> Result<Outcome, AgentError> {
        let mut dedup = ConfirmationDeduplicator::default();

        for iteration in 0..MAX_ITERATIONS {
            let offer_tools = iteration + 1 < MAX_ITERATIONS;
            let tools = offer_tools.then(|| self.registry.definitions());

            let started = Instant::now();
            let response = self.gateway.complete(&history, tools).await?;
            tracing::info!(
                iteration,
                offer_tools,
                history_messages = history.len(),
                choices = response.choices.len(),
                latency_ms = started.elapsed().as_millis() as u64,
                "gateway call completed"
            );

            let Some(call) = first_function_call(&response) else {
                writer.text_deltas(&response.choices).await?;
                writer.done().await?;
                return Ok(Outcome::Answered {
                    gateway_calls: iteration + 1,
                });
            };

            let invocation = self.registry.decode(call)?;
            tracing::info!(iteration, tool_name = invocation.tool_name(), "dispatching tool call");
            match invocation {
                ToolInvocation::ListIssues(args) => {
                    let message = list_issues(self.tracker, &args).await?;
                    history.push(message);
                }
                ToolInvocation::CreateIssueDialog(args) => {
                    let dialog = create_issue_dialog(&args)?;
                    if dedup.first_sighting(&dialog.request.confirmation)? {
                        writer.confirmation(&dialog.request).await?;
                        history.push(dialog.message);
                    } else {
                        tracing::debug!(
                            iteration,
                            dialogs_shown = dedup.shown_count(),
                            "duplicate confirmation dialog skipped"
                        );
                    }
                }
            }
        }

        tracing::warn!(max_iterations = MAX_ITERATIONS, "tool loop limit reached");
        writer.text(FALLBACK_MESSAGE).await?;
        writer.done().await?;
        Ok(Outcome::IterationsExhausted)
    }
}
