//! The injected agent-query capability.
//!
//! The engine never talks to a model directly. It builds an [`AgentRequest`]
//! and consumes the [`MessageStream`] returned by an [`AgentQuery`]
//! implementation until the stream ends.

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StepError;

/// Everything an agent invocation needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub setting_sources: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// JSON schema the final result should satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ResultMessage {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            subtype: "success".to_string(),
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn structured(output: Value) -> Self {
        Self {
            subtype: "success".to_string(),
            structured_output: Some(output),
            ..Default::default()
        }
    }

    pub fn error(subtype: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            subtype: subtype.into(),
            is_error: true,
            errors,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }

    /// Structured output if present, else the text result parsed as JSON
    /// (bare or in a fenced block), else the text itself.
    pub fn payload(&self) -> Value {
        if let Some(ref structured) = self.structured_output {
            return structured.clone();
        }
        let Some(ref text) = self.result else {
            return Value::Null;
        };
        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            return value;
        }
        if let Some(block) = fenced_json(text) {
            if let Ok(value) = serde_json::from_str::<Value>(block) {
                return value;
            }
        }
        Value::String(text.clone())
    }
}

fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json").map(|i| i + "```json".len())?;
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// A message produced during an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Result(ResultMessage),
}

pub type MessageStream = BoxStream<'static, Result<AgentMessage, String>>;

/// The capability the executor depends on for agent-prompt steps.
pub trait AgentQuery: Send + Sync {
    fn query(&self, request: AgentRequest) -> MessageStream;
}

/// What an invocation produced once its stream ended.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub result: ResultMessage,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub tool_uses: usize,
}

impl AgentRun {
    /// Session facts worth recording on the audit entry.
    pub fn metadata(&self) -> Value {
        let mut meta = serde_json::Map::new();
        if let Some(ref id) = self.session_id {
            meta.insert("sessionId".into(), Value::String(id.clone()));
        }
        if let Some(ref model) = self.model {
            meta.insert("model".into(), Value::String(model.clone()));
        }
        if let Some(turns) = self.result.num_turns {
            meta.insert("numTurns".into(), Value::from(turns));
        }
        if let Some(cost) = self.result.total_cost_usd {
            meta.insert("totalCostUsd".into(), Value::from(cost));
        }
        if self.tool_uses > 0 {
            meta.insert("toolUses".into(), Value::from(self.tool_uses));
        }
        Value::Object(meta)
    }
}

/// Drain the stream. The last `result` message wins; a stream that ends
/// without one, or whose last one is not a success, is a failure.
pub async fn collect_result(mut stream: MessageStream) -> Result<AgentRun, StepError> {
    let mut last: Option<ResultMessage> = None;
    let mut session_id = None;
    let mut model = None;
    let mut tool_uses = 0;

    while let Some(message) = stream.next().await {
        match message.map_err(StepError::Agent)? {
            AgentMessage::System {
                session_id: sid,
                model: m,
            } => {
                session_id = sid.or(session_id);
                model = m.or(model);
            }
            AgentMessage::Assistant { text } => {
                tracing::trace!("[Agent] {}", text);
            }
            AgentMessage::ToolUse { name, .. } => {
                tracing::debug!("[Agent] tool use: {}", name);
                tool_uses += 1;
            }
            AgentMessage::Result(result) => {
                last = Some(result);
            }
        }
    }

    let result = last.ok_or(StepError::NoResult)?;
    if !result.is_success() {
        return Err(StepError::AgentResult {
            subtype: result.subtype.clone(),
            errors: result.errors.clone(),
        });
    }
    Ok(AgentRun {
        session_id: result.session_id.clone().or(session_id),
        model,
        tool_uses,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream(messages: Vec<AgentMessage>) -> MessageStream {
        futures::stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_last_result_wins() {
        let run = collect_result(stream(vec![
            AgentMessage::System {
                session_id: Some("s-1".into()),
                model: Some("sonnet".into()),
            },
            AgentMessage::Result(ResultMessage::error("error_during_execution", vec![])),
            AgentMessage::Result(ResultMessage::structured(json!({ "ok": true }))),
        ]))
        .await
        .unwrap();
        assert_eq!(run.result.payload(), json!({ "ok": true }));
        assert_eq!(run.session_id.as_deref(), Some("s-1"));

        let err = collect_result(stream(vec![
            AgentMessage::Result(ResultMessage::success("fine")),
            AgentMessage::Result(ResultMessage::error("error_max_turns", vec!["limit".into()])),
        ]))
        .await
        .unwrap_err();
        assert!(matches!(err, StepError::AgentResult { ref subtype, .. } if subtype == "error_max_turns"));
    }

    #[tokio::test]
    async fn test_second_success_replaces_first() {
        let run = collect_result(stream(vec![
            AgentMessage::Result(ResultMessage::structured(json!({ "draft": 1 }))),
            AgentMessage::Assistant { text: "revising".into() },
            AgentMessage::Result(ResultMessage::structured(json!({ "draft": 2 }))),
        ]))
        .await
        .unwrap();
        assert_eq!(run.result.payload(), json!({ "draft": 2 }));
    }

    #[tokio::test]
    async fn test_no_result_is_failure() {
        let err = collect_result(stream(vec![AgentMessage::Assistant { text: "hi".into() }]))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NoResult));
    }

    #[tokio::test]
    async fn test_stream_error_is_failure() {
        let s: MessageStream = futures::stream::iter(vec![Err("connection reset".to_string())]).boxed();
        let err = collect_result(s).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_payload_extraction() {
        assert_eq!(ResultMessage::success("{\"a\":1}").payload(), json!({ "a": 1 }));
        assert_eq!(
            ResultMessage::success("Here you go:\n```json\n{\"tasks\": []}\n```\n").payload(),
            json!({ "tasks": [] })
        );
        assert_eq!(ResultMessage::success("plain text").payload(), json!("plain text"));
        assert_eq!(ResultMessage::default().payload(), Value::Null);
    }

    #[test]
    fn test_message_wire_format() {
        let msg: AgentMessage = serde_json::from_value(json!({
            "type": "result",
            "subtype": "success",
            "result": "done",
            "num_turns": 3
        }))
        .unwrap();
        match msg {
            AgentMessage::Result(r) => {
                assert!(r.is_success());
                assert_eq!(r.num_turns, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        let tool: AgentMessage = serde_json::from_value(json!({ "type": "tool-use", "name": "Read" })).unwrap();
        assert!(matches!(tool, AgentMessage::ToolUse { .. }));
    }
}
