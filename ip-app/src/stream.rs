//! Incremental response framing.
//!
//! Every unit is one `data:` line (optionally preceded by an `event:` line)
//! followed by a blank line, and is handed to the HTTP body as one write.

use crate::error::AgentError;
use bytes::Bytes;
use ip_llm::Choice;
use ip_tools::ConfirmationRequest;
use serde_json::json;
use tokio::sync::mpsc;

pub const CONFIRMATION_EVENT: &str = "copilot_confirmation";
pub const ERROR_EVENT: &str = "copilot_errors";
const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone)]
pub enum StreamEvent<'a> {
    TextDelta { index: u32, content: &'a str },
    Confirmation(&'a ConfirmationRequest),
    Error(&'a AgentError),
    Done,
}

impl StreamEvent<'_> {
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        let frame = match self {
            Self::TextDelta { index, content } => {
                let data = json!({
                    "choices": [{
                        "index": index,
                        "delta": { "role": "assistant", "content": content },
                    }]
                });
                frame(None, &serde_json::to_string(&data)?)
            }
            Self::Confirmation(request) => {
                frame(Some(CONFIRMATION_EVENT), &serde_json::to_string(request)?)
            }
            Self::Error(err) => {
                let data = json!([{
                    "type": "agent",
                    "code": err.code(),
                    "message": err.public_message(),
                    "identifier": uuid::Uuid::new_v4().to_string(),
                }]);
                frame(Some(ERROR_EVENT), &serde_json::to_string(&data)?)
            }
            Self::Done => frame(None, DONE_DATA),
        };
        Ok(Bytes::from(frame))
    }
}

fn frame(event: Option<&str>, data: &str) -> String {
    match event {
        Some(event) => format!("event: {event}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

/// Write half of a streamed response. The read half becomes the HTTP body.
pub struct ResponseWriter {
    tx: mpsc::Sender<Bytes>,
    units_written: usize,
}

impl ResponseWriter {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                units_written: 0,
            },
            rx,
        )
    }

    pub fn has_written(&self) -> bool {
        self.units_written > 0
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn write(&mut self, event: StreamEvent<'_>) -> Result<(), AgentError> {
        let bytes = event
            .encode()
            .map_err(|e| AgentError::Internal(format!("encode stream event: {e}")))?;
        self.tx
            .send(bytes)
            .await
            .map_err(|_| AgentError::StreamClosed)?;
        self.units_written += 1;
        Ok(())
    }

    /// One delta per choice, in gateway order.
    pub async fn text_deltas(&mut self, choices: &[Choice]) -> Result<(), AgentError> {
        for choice in choices {
            self.write(StreamEvent::TextDelta {
                index: choice.index,
                content: &choice.message.content,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn text(&mut self, content: &str) -> Result<(), AgentError> {
        self.write(StreamEvent::TextDelta { index: 0, content }).await
    }

    pub async fn confirmation(&mut self, request: &ConfirmationRequest) -> Result<(), AgentError> {
        self.write(StreamEvent::Confirmation(request)).await
    }

    pub async fn error(&mut self, err: &AgentError) -> Result<(), AgentError> {
        self.write(StreamEvent::Error(err)).await
    }

    pub async fn done(&mut self) -> Result<(), AgentError> {
        self.write(StreamEvent::Done).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_llm::{ChoiceMessage, Role};
    use ip_tools::Confirmation;

    fn text(bytes: &Bytes) -> &str {
        std::str::from_utf8(bytes).expect("utf8 frame")
    }

    #[test]
    fn text_delta_frame_matches_wire_format() {
        let bytes = StreamEvent::TextDelta {
            index: 1,
            content: "hello \"there\"\nfriend",
        }
        .encode()
        .expect("encode");
        assert_eq!(
            text(&bytes),
            "data: {\"choices\":[{\"index\":1,\"delta\":{\"role\":\"assistant\",\"content\":\"hello \\\"there\\\"\\nfriend\"}}]}\n\n"
        );
    }

    #[test]
    fn confirmation_frame_names_event() {
        let request = ConfirmationRequest::create_issue(Confirmation {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            title: "Bug".to_string(),
            body: "desc".to_string(),
        });
        let bytes = StreamEvent::Confirmation(&request).encode().expect("encode");
        let frame = text(&bytes);
        assert!(frame.starts_with("event: copilot_confirmation\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        let data = frame
            .trim_end()
            .strip_prefix("event: copilot_confirmation\ndata: ")
            .expect("data line");
        let value: serde_json::Value = serde_json::from_str(data).expect("json payload");
        assert_eq!(value["type"], "action");
        assert_eq!(value["confirmation"]["repo"], "widgets");
    }

    #[test]
    fn error_frame_carries_code() {
        let err = AgentError::UnknownFunctionCall("rm_rf".to_string());
        let bytes = StreamEvent::Error(&err).encode().expect("encode");
        let frame = text(&bytes);
        assert!(frame.starts_with("event: copilot_errors\ndata: [{"));
        assert!(frame.contains("\"code\":\"unknown_function_call\""));
    }

    #[tokio::test]
    async fn writer_emits_one_unit_per_choice_then_done() {
        let (mut writer, mut rx) = ResponseWriter::channel(8);
        assert!(!writer.has_written());
        let choices = vec![
            Choice {
                index: 0,
                message: ChoiceMessage {
                    role: Role::Assistant,
                    content: "a".to_string(),
                    tool_calls: vec![],
                },
                finish_reason: None,
            },
            Choice {
                index: 1,
                message: ChoiceMessage {
                    role: Role::Assistant,
                    content: "b".to_string(),
                    tool_calls: vec![],
                },
                finish_reason: None,
            },
        ];
        writer.text_deltas(&choices).await.expect("deltas");
        writer.done().await.expect("done");
        assert!(writer.has_written());
        drop(writer);

        let mut frames = Vec::new();
        while let Some(bytes) = rx.recv().await {
            frames.push(String::from_utf8(bytes.to_vec()).expect("utf8"));
        }
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains("\"index\":0"));
        assert!(frames[1].contains("\"index\":1"));
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn write_after_reader_drop_reports_closed_stream() {
        let (mut writer, rx) = ResponseWriter::channel(1);
        drop(rx);
        let err = writer.text("late").await.expect_err("closed stream");
        assert!(matches!(err, AgentError::StreamClosed));
        assert!(!writer.has_written());
    }
}
