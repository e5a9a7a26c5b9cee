use crate::error::{LlmError, Result};
use crate::types::{
    ChatMessage, ChatResponse, Choice, ChoiceMessage, FunctionCall, Role, ToolCall, ToolDefinition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const INTEGRATION_ID_HEADER: &str = "Copilot-Integration-Id";

/// One request/response exchange with the upstream model.
///
/// `tools: None` withholds every declaration, which forces a plain-text answer.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatResponse>;
}

/// Client for an OpenAI-compatible `chat/completions` endpoint, bound to the
/// credentials of a single inbound request.
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    integration_id: Option<String>,
}

impl CompletionClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        model: &str,
        api_key: &str,
        integration_id: Option<String>,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(LlmError::InvalidInput("completion base url is required".to_string()));
        }
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        Ok(Self {
            http,
            endpoint: format!("{base_url}/chat/completions"),
            model: model.to_string(),
            api_key: api_key.to_string(),
            integration_id: integration_id
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

#[async_trait]
impl CompletionGateway for CompletionClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatResponse> {
        let req = WireChatRequest::new(&self.model, messages, tools);

        let mut builder = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req);
        if let Some(integration_id) = self.integration_id.as_deref() {
            builder = builder.header(INTEGRATION_ID_HEADER, integration_id);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "completion request rejected");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: WireChatResponse = serde_json::from_str(&body)?;
        let out = ChatResponse::from(parsed);
        tracing::debug!(
            choices = out.choices.len(),
            tool_calls = out
                .choices
                .first()
                .map(|c| c.message.tool_calls.len())
                .unwrap_or(0),
            "completion response parsed"
        );
        Ok(out)
    }
}

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

impl<'a> WireChatRequest<'a> {
    fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        tools: Option<&'a [ToolDefinition]>,
    ) -> Self {
        let tools: Vec<WireTool<'a>> = tools
            .unwrap_or_default()
            .iter()
            .map(|t| WireTool {
                r#type: "function",
                function: t,
            })
            .collect();
        let tool_choice = if tools.is_empty() { None } else { Some("auto") };
        Self {
            model,
            messages,
            tools,
            tool_choice,
            stream: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    message: WireChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: WireToolCallFunction,
}

#[derive(Debug, Default, Deserialize)]
struct WireToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<WireChatResponse> for ChatResponse {
    fn from(v: WireChatResponse) -> Self {
        let choices = v
            .choices
            .into_iter()
            .enumerate()
            .map(|(position, choice)| Choice {
                index: choice.index.unwrap_or(position as u32),
                message: ChoiceMessage {
                    role: Role::Assistant,
                    content: choice.message.content.unwrap_or_default(),
                    tool_calls: choice
                        .message
                        .tool_calls
                        .unwrap_or_default()
                        .into_iter()
                        .map(|tc| ToolCall {
                            id: tc.id,
                            function: FunctionCall {
                                name: tc.function.name,
                                arguments: tc.function.arguments,
                            },
                        })
                        .collect(),
                },
                finish_reason: choice.finish_reason,
            })
            .collect();
        Self { choices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>;

    async fn spawn_upstream(status: StatusCode, reply: serde_json::Value) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let app = axum::Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                let reply = reply.clone();
                async move {
                    sink.lock().expect("capture lock").push((headers, body));
                    (status, Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("upstream addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve upstream");
        });
        (format!("http://{addr}"), captured)
    }

    fn list_issues_tool() -> ToolDefinition {
        ToolDefinition {
            name: "list_issues".to_string(),
            description: "List issues".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn new_rejects_blank_credentials() {
        let err = CompletionClient::new(reqwest::Client::new(), "http://x", "gpt-4o", "  ", None)
            .err()
            .expect("blank key rejected");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn request_omits_tools_when_withheld() {
        let messages = vec![ChatMessage::user("hi")];
        let req = WireChatRequest::new("gpt-4o", &messages, None);
        let value = serde_json::to_value(&req).expect("serialize request");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn request_wraps_tools_as_functions() {
        let messages = vec![ChatMessage::user("hi")];
        let tools = vec![list_issues_tool()];
        let req = WireChatRequest::new("gpt-4o", &messages, Some(&tools));
        let value = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "list_issues");
        assert_eq!(value["tool_choice"], "auto");
    }

    #[tokio::test]
    async fn complete_sends_credentials_and_parses_tool_call() {
        let (base_url, captured) = spawn_upstream(
            StatusCode::OK,
            json!({
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {
                                "name": "list_issues",
                                "arguments": "{\"repository_owner\":\"acme\",\"repository_name\":\"widgets\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            }),
        )
        .await;

        let client = CompletionClient::new(
            reqwest::Client::new(),
            &base_url,
            "gpt-4o",
            "tok_123",
            Some("integration-7".to_string()),
        )
        .expect("client");
        let tools = vec![list_issues_tool()];
        let response = client
            .complete(&[ChatMessage::user("show issues")], Some(&tools))
            .await
            .expect("completion");

        let call = crate::first_function_call(&response).expect("function call");
        assert_eq!(call.name, "list_issues");
        assert!(response.choices[0].message.content.is_empty());

        let captured = captured.lock().expect("capture lock");
        assert_eq!(captured.len(), 1);
        let (headers, body) = &captured[0];
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer tok_123")
        );
        assert_eq!(
            headers
                .get("copilot-integration-id")
                .and_then(|v| v.to_str().ok()),
            Some("integration-7")
        );
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["tools"][0]["function"]["name"], "list_issues");
    }

    #[tokio::test]
    async fn complete_surfaces_non_success_status() {
        let (base_url, _captured) =
            spawn_upstream(StatusCode::UNAUTHORIZED, json!({"error": "bad token"})).await;
        let client =
            CompletionClient::new(reqwest::Client::new(), &base_url, "gpt-4o", "tok", None)
                .expect("client");
        let err = client
            .complete(&[ChatMessage::user("hi")], None)
            .await
            .expect_err("status error");
        match err {
            LlmError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad token"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
