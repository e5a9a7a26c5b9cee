//! Issue tools for the issuepilot agent.
//!
//! The registry declares what the model may call; the executors run those
//! calls against the issue tracker.

mod args;
mod confirmation;
mod error;
mod executors;
mod github;
mod registry;

pub use args::{CreateIssueDialogArgs, ListIssuesArgs, ToolInvocation};
pub use confirmation::{Confirmation, ConfirmationRequest};
pub use error::{DispatchError, Result, ToolError};
pub use executors::{IssueDialog, create_issue, create_issue_dialog, list_issues};
pub use github::{GithubClient, Issue, IssueLabel, IssueTracker, IssueUser};
pub use registry::{
    CREATE_ISSUE_DIALOG, LIST_ISSUES, ParameterSpec, ToolDeclaration, ToolRegistry,
    to_llm_tool_def,
};
