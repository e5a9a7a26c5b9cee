//! Inbound request decoding: credentials from headers, conversation from body.

use crate::error::AgentError;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use ip_llm::{ChatMessage, Role};
use ip_tools::Confirmation;
use serde::Deserialize;

const GITHUB_TOKEN_HEADER: &str = "x-github-token";
const INTEGRATION_ID_HEADER: &str = "copilot-integration-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionState {
    Accepted,
    Rejected,
    Dismissed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfirmationDecision {
    pub state: DecisionState,
    pub confirmation: Confirmation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "copilot_confirmations")]
    pub confirmations: Option<Vec<ConfirmationDecision>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRequest {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

impl AgentRequest {
    pub fn parse(body: &[u8]) -> Result<Self, AgentError> {
        let request: AgentRequest = serde_json::from_slice(body)
            .map_err(|e| AgentError::MalformedRequestBody(e.to_string()))?;
        if request.messages.is_empty() {
            return Err(AgentError::MalformedRequestBody("messages must not be empty".to_string()));
        }
        Ok(request)
    }

    /// The first accepted decision attached to the last message, if any.
    pub fn accepted_confirmation(&self) -> Option<&Confirmation> {
        self.messages
            .last()?
            .confirmations
            .as_deref()?
            .iter()
            .find(|d| d.state == DecisionState::Accepted)
            .map(|d| &d.confirmation)
    }

    /// The conversation as forwarded to the completion gateway, decisions stripped.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone().unwrap_or_default(),
            })
            .collect()
    }
}

/// Caller-supplied credentials, forwarded to both upstream services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub integration_id: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AgentError> {
        let token = parse_bearer_token(headers)
            .or_else(|| header_value(headers, GITHUB_TOKEN_HEADER))
            .ok_or_else(|| AgentError::MissingCredentials("missing bearer token".to_string()))?;
        Ok(Self {
            token,
            integration_id: header_value(headers, INTEGRATION_ID_HEADER),
        })
    }
}

pub fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_conversation() {
        let request = AgentRequest::parse(
            br#"{"messages":[{"role":"user","content":"show issues for acme/widgets"}]}"#,
        )
        .expect("parse request");
        assert!(request.accepted_confirmation().is_none());
        assert_eq!(
            request.history(),
            vec![ChatMessage::user("show issues for acme/widgets")]
        );
    }

    #[test]
    fn finds_accepted_decision_on_last_message() {
        let request = AgentRequest::parse(
            br#"{"messages":[
                {"role":"user","content":"file a bug"},
                {"role":"user","content":"","copilot_confirmations":[
                    {"state":"accepted","confirmation":{"owner":"acme","repo":"widgets","title":"Bug","body":"desc"}}
                ]}
            ]}"#,
        )
        .expect("parse request");
        let confirmation = request.accepted_confirmation().expect("accepted");
        assert_eq!(confirmation.owner, "acme");
        assert_eq!(confirmation.title, "Bug");
    }

    #[test]
    fn ignores_decisions_on_earlier_messages_and_rejections() {
        let request = AgentRequest::parse(
            br#"{"messages":[
                {"role":"user","content":"x","confirmations":[
                    {"state":"accepted","confirmation":{"owner":"a","repo":"b","title":"c","body":"d"}}
                ]},
                {"role":"user","content":"y","confirmations":[
                    {"state":"rejected","confirmation":{"owner":"a","repo":"b","title":"c","body":"d"}}
                ]}
            ]}"#,
        )
        .expect("parse request");
        assert!(request.accepted_confirmation().is_none());
    }

    #[test]
    fn unknown_decision_state_is_tolerated() {
        let request = AgentRequest::parse(
            br#"{"messages":[{"role":"user","content":null,"confirmations":[
                {"state":"snoozed","confirmation":{"owner":"a","repo":"b","title":"c"}}
            ]}]}"#,
        )
        .expect("parse request");
        assert!(request.accepted_confirmation().is_none());
        assert_eq!(request.history()[0].content, "");
    }

    #[test]
    fn rejects_empty_or_invalid_bodies() {
        assert!(matches!(
            AgentRequest::parse(br#"{"messages":[]}"#),
            Err(AgentError::MalformedRequestBody(_))
        ));
        assert!(matches!(
            AgentRequest::parse(b"not json"),
            Err(AgentError::MalformedRequestBody(_))
        ));
        assert!(matches!(
            AgentRequest::parse(br#"{"messages":[{"role":"tool","content":"x"}]}"#),
            Err(AgentError::MalformedRequestBody(_))
        ));
    }

    #[test]
    fn credentials_prefer_bearer_and_fall_back_to_github_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer tok_a".parse().expect("header"));
        headers.insert("copilot-integration-id", "int-1".parse().expect("header"));
        let creds = Credentials::from_headers(&headers).expect("credentials");
        assert_eq!(creds.token, "tok_a");
        assert_eq!(creds.integration_id.as_deref(), Some("int-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-github-token", "tok_b".parse().expect("header"));
        let creds = Credentials::from_headers(&headers).expect("credentials");
        assert_eq!(creds.token, "tok_b");
        assert!(creds.integration_id.is_none());
    }

    #[test]
    fn missing_token_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic abc".parse().expect("header"));
        assert!(matches!(
            Credentials::from_headers(&headers),
            Err(AgentError::MissingCredentials(_))
        ));
    }
}
