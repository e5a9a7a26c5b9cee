use crate::args::{CreateIssueDialogArgs, ListIssuesArgs};
use crate::confirmation::{Confirmation, ConfirmationRequest};
use crate::error::Result;
use crate::github::IssueTracker;
use ip_llm::ChatMessage;
use std::time::Instant;

/// A confirmation dialog plus the system message that records its creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDialog {
    pub request: ConfirmationRequest,
    pub message: ChatMessage,
}

/// Fetch the repository's issues and fold them into a system message.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(owner = %args.repository_owner, repo = %args.repository_name)
)]
pub async fn list_issues(tracker: &dyn IssueTracker, args: &ListIssuesArgs) -> Result<ChatMessage> {
    let started = Instant::now();
    let issues = tracker
        .list_issues(&args.repository_owner, &args.repository_name)
        .await?;
    let issues_json = serde_json::to_string(&issues)?;
    tracing::info!(
        issue_count = issues.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        "list_issues executed"
    );
    Ok(ChatMessage::system(format!(
        "The issues for the repository {}/{} are: {issues_json}",
        args.repository_owner, args.repository_name
    )))
}

/// Build the confirmation dialog for a proposed issue. No I/O.
pub fn create_issue_dialog(args: &CreateIssueDialogArgs) -> Result<IssueDialog> {
    let confirmation = Confirmation {
        owner: args.repository_owner.clone(),
        repo: args.repository_name.clone(),
        title: args.issue_title.clone(),
        body: args.issue_body.clone(),
    };
    let message = ChatMessage::system(format!("Issue dialog created: {}", confirmation.key()?));
    Ok(IssueDialog {
        request: ConfirmationRequest::create_issue(confirmation),
        message,
    })
}

/// Create the confirmed issue. Single attempt; the caller decides what a
/// failure means for the request.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(owner = %confirmation.owner, repo = %confirmation.repo)
)]
pub async fn create_issue(
    tracker: &dyn IssueTracker,
    confirmation: &Confirmation,
) -> Result<ChatMessage> {
    let issue = tracker
        .create_issue(
            &confirmation.owner,
            &confirmation.repo,
            &confirmation.title,
            &confirmation.body,
        )
        .await?;
    tracing::info!(issue_number = issue.number, "create_issue executed");
    Ok(ChatMessage::assistant(format!(
        "Created issue {} on repository {}/{}",
        confirmation.title, confirmation.owner, confirmation.repo
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::github::Issue;
    use async_trait::async_trait;
    use ip_llm::Role;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTracker {
        issues: Vec<Issue>,
        fail: bool,
        created: Mutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn list_issues(&self, owner: &str, repo: &str) -> Result<Vec<Issue>> {
            if self.fail {
                return Err(ToolError::NotFound(format!("repository {owner}/{repo}")));
            }
            Ok(self.issues.clone())
        }

        async fn create_issue(
            &self,
            owner: &str,
            repo: &str,
            title: &str,
            body: &str,
        ) -> Result<Issue> {
            if self.fail {
                return Err(ToolError::Unauthorized("bad credentials".to_string()));
            }
            self.created.lock().expect("created lock").push((
                owner.to_string(),
                repo.to_string(),
                title.to_string(),
                body.to_string(),
            ));
            Ok(issue(9, title))
        }
    }

    fn issue(number: u64, title: &str) -> Issue {
        Issue {
            number,
            title: title.to_string(),
            state: "open".to_string(),
            html_url: format!("https://example.test/{number}"),
            body: None,
            user: None,
            labels: vec![],
        }
    }

    fn list_args() -> ListIssuesArgs {
        ListIssuesArgs {
            repository_owner: "acme".to_string(),
            repository_name: "widgets".to_string(),
        }
    }

    #[tokio::test]
    async fn list_issues_embeds_issue_json() {
        let tracker = FakeTracker {
            issues: vec![issue(1, "First"), issue(2, "Second")],
            ..FakeTracker::default()
        };
        let message = list_issues(&tracker, &list_args()).await.expect("list");
        assert_eq!(message.role, Role::System);

        let prefix = "The issues for the repository acme/widgets are: ";
        let json = message
            .content
            .strip_prefix(prefix)
            .expect("message prefix");
        let decoded: Vec<Issue> = serde_json::from_str(json).expect("issue json");
        assert_eq!(decoded, tracker.issues);
    }

    #[tokio::test]
    async fn list_issues_propagates_tracker_failure() {
        let tracker = FakeTracker {
            fail: true,
            ..FakeTracker::default()
        };
        let err = list_issues(&tracker, &list_args())
            .await
            .expect_err("tracker failure");
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn dialog_pairs_request_with_system_message() {
        let dialog = create_issue_dialog(&CreateIssueDialogArgs {
            repository_owner: "acme".to_string(),
            repository_name: "widgets".to_string(),
            issue_title: "Bug".to_string(),
            issue_body: "desc".to_string(),
        })
        .expect("dialog");
        assert_eq!(dialog.request.confirmation.owner, "acme");
        assert_eq!(dialog.message.role, Role::System);
        assert!(dialog.message.content.starts_with("Issue dialog created: "));
        assert!(dialog.message.content.contains("\"title\":\"Bug\""));
    }

    #[tokio::test]
    async fn create_issue_summarizes_once() {
        let tracker = FakeTracker::default();
        let confirmation = Confirmation {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            title: "Bug".to_string(),
            body: "desc".to_string(),
        };
        let message = create_issue(&tracker, &confirmation)
            .await
            .expect("create");
        assert_eq!(message.content, "Created issue Bug on repository acme/widgets");
        let created = tracker.created.lock().expect("created lock");
        assert_eq!(
            *created,
            vec![(
                "acme".to_string(),
                "widgets".to_string(),
                "Bug".to_string(),
                "desc".to_string()
            )]
        );
    }
}
