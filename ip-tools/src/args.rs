use crate::error::DispatchError;
use crate::registry::{CREATE_ISSUE_DIALOG, LIST_ISSUES};
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListIssuesArgs {
    pub repository_owner: String,
    pub repository_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateIssueDialogArgs {
    pub repository_owner: String,
    pub repository_name: String,
    pub issue_title: String,
    pub issue_body: String,
}

/// A function call decoded into the arguments of a known tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    ListIssues(ListIssuesArgs),
    CreateIssueDialog(CreateIssueDialogArgs),
}

impl ToolInvocation {
    pub fn decode(name: &str, arguments: &str) -> Result<Self, DispatchError> {
        match name {
            LIST_ISSUES => {
                let args: ListIssuesArgs = decode_json(name, arguments)?;
                require_non_empty(name, "repository_owner", &args.repository_owner)?;
                require_non_empty(name, "repository_name", &args.repository_name)?;
                Ok(Self::ListIssues(args))
            }
            CREATE_ISSUE_DIALOG => {
                let args: CreateIssueDialogArgs = decode_json(name, arguments)?;
                require_non_empty(name, "repository_owner", &args.repository_owner)?;
                require_non_empty(name, "repository_name", &args.repository_name)?;
                require_non_empty(name, "issue_title", &args.issue_title)?;
                Ok(Self::CreateIssueDialog(args))
            }
            other => Err(DispatchError::UnknownTool(other.to_string())),
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::ListIssues(_) => LIST_ISSUES,
            Self::CreateIssueDialog(_) => CREATE_ISSUE_DIALOG,
        }
    }
}

fn decode_json<T: DeserializeOwned>(tool: &str, arguments: &str) -> Result<T, DispatchError> {
    // Some models send an empty string for a call without arguments.
    let raw = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(raw).map_err(|e| DispatchError::MalformedArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn require_non_empty(tool: &str, key: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::MalformedArguments {
            tool: tool.to_string(),
            reason: format!("{key} must not be empty"),
        });
    }
    Ok(())
}
