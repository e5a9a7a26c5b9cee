use serde::{Deserialize, Serialize};

/// The issue a confirmation dialog asks the user to approve. Also the
/// identity of the dialog: two dialogs with equal tuples are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Confirmation {
    pub owner: String,
    pub repo: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl Confirmation {
    /// Serialized form, used as the deduplication key.
    pub fn key(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of a `copilot_confirmation` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: String,
    pub message: String,
    pub confirmation: Confirmation,
}

impl ConfirmationRequest {
    pub fn create_issue(confirmation: Confirmation) -> Self {
        let message = format!(
            "Are you sure you want to create an issue in repository {}/{} with the title \"{}\" and the content \"{}\"",
            confirmation.owner, confirmation.repo, confirmation.title, confirmation.body
        );
        Self {
            kind: "action",
            title: "Create Issue".to_string(),
            message,
            confirmation,
        }
    }
}
