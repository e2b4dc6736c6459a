//! Messages API agent: an [`AgentQuery`] backed by an Anthropic-compatible
//! HTTP endpoint.
//!
//! This is the host adapter the CLI uses. Each query is a single-shot
//! request: no tool loop runs, so `allowedTools` only shows up in the logs.
//! When an output schema is supplied, the system prompt asks for a JSON
//! document matching it and the reply is parsed by
//! [`ResultMessage::payload`].

use serde_json::{json, Value};

use crate::workflow::agent::{AgentMessage, AgentQuery, AgentRequest, MessageStream, ResultMessage};

/// Connection settings for the Messages API.
#[derive(Debug, Clone)]
pub struct MessagesApiConfig {
    /// API base URL, without the `/v1/messages` suffix
    pub base_url: String,
    /// API key, sent as `x-api-key`
    pub api_key: String,
    /// Model used when neither step, agent nor workflow picks one
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl Default for MessagesApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            temperature: None,
        }
    }
}

/// Text and usage extracted from a Messages API reply.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagesReply {
    pub text: String,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Option<Value>,
}

pub struct MessagesApiAgent {
    client: reqwest::Client,
    config: MessagesApiConfig,
}

impl MessagesApiAgent {
    pub fn new(config: MessagesApiConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
        }
    }

    pub fn config(&self) -> &MessagesApiConfig {
        &self.config
    }
}

fn system_prompt(request: &AgentRequest) -> Option<String> {
    let schema_note = request.output_schema.as_ref().map(|schema| {
        format!(
            "Respond with a single JSON document that matches this JSON schema, and nothing else:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
        )
    });
    match (request.system_prompt.as_deref(), schema_note) {
        (Some(sp), Some(note)) if !sp.is_empty() => Some(format!("{}\n\n{}", sp, note)),
        (Some(sp), None) if !sp.is_empty() => Some(sp.to_string()),
        (_, note) => note,
    }
}

/// Body for `POST {base_url}/v1/messages`.
pub fn build_body(config: &MessagesApiConfig, request: &AgentRequest, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": config.max_tokens,
        "messages": [
            {
                "role": "user",
                "content": request.prompt
            }
        ]
    });

    if let Some(system) = system_prompt(request) {
        body["system"] = Value::String(system);
    }

    if let Some(temp) = config.temperature {
        body["temperature"] = Value::Number(
            serde_json::Number::from_f64(temp).unwrap_or_else(|| serde_json::Number::from(0)),
        );
    }

    body
}

/// Pull the concatenated text blocks out of a Messages API response.
pub fn parse_reply(json: &Value, fallback_model: &str) -> MessagesReply {
    let text = json
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                    } else {
                        None
                    }
                })
                .reduce(|a, b| format!("{}\n{}", a, b))
        })
        .unwrap_or_default();

    MessagesReply {
        text,
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(fallback_model)
            .to_string(),
        stop_reason: json
            .get("stop_reason")
            .and_then(|s| s.as_str())
            .map(str::to_string),
        usage: json.get("usage").cloned(),
    }
}

async fn call(
    client: &reqwest::Client,
    config: &MessagesApiConfig,
    request: &AgentRequest,
    model: &str,
) -> Result<MessagesReply, String> {
    let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
    let body = build_body(config, request, model);

    tracing::info!("[AgentCaller] Calling Messages API: {} (model: {})", url, model);
    if !request.allowed_tools.is_empty() {
        tracing::debug!(
            "[AgentCaller] Single-shot call, tools not offered: {}",
            request.allowed_tools.join(", ")
        );
    }

    let response = client
        .post(&url)
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("HTTP request failed: {}", e))?;

    let status = response.status();
    let response_text = response
        .text()
        .await
        .map_err(|e| format!("Failed to read response body: {}", e))?;

    if !status.is_success() {
        return Err(format!("API returned {}: {}", status, response_text));
    }

    let json: Value = serde_json::from_str(&response_text)
        .map_err(|e| format!("Failed to parse response JSON: {}", e))?;
    Ok(parse_reply(&json, model))
}

impl AgentQuery for MessagesApiAgent {
    fn query(&self, request: AgentRequest) -> MessageStream {
        let client = self.client.clone();
        let config = self.config.clone();

        Box::pin(async_stream::stream! {
            let model = request.model.clone().unwrap_or_else(|| config.model.clone());
            let session_id = uuid::Uuid::new_v4().to_string();
            yield Ok(AgentMessage::System {
                session_id: Some(session_id.clone()),
                model: Some(model.clone()),
            });

            match call(&client, &config, &request, &model).await {
                Ok(reply) => {
                    if !reply.text.is_empty() {
                        yield Ok(AgentMessage::Assistant { text: reply.text.clone() });
                    }
                    let result = if reply.stop_reason.as_deref() == Some("max_tokens") {
                        ResultMessage::error(
                            "error_max_tokens",
                            vec![format!("reply truncated at {} tokens", config.max_tokens)],
                        )
                    } else {
                        ResultMessage::success(reply.text)
                    };
                    yield Ok(AgentMessage::Result(ResultMessage {
                        num_turns: Some(1),
                        usage: reply.usage,
                        session_id: Some(session_id),
                        ..result
                    }));
                }
                Err(e) => {
                    tracing::error!("[AgentCaller] {}", e);
                    yield Ok(AgentMessage::Result(ResultMessage {
                        session_id: Some(session_id),
                        ..ResultMessage::error("error_during_execution", vec![e])
                    }));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_carries_system_prompt_and_schema() {
        let config = MessagesApiConfig {
            temperature: Some(0.2),
            ..Default::default()
        };
        let request = AgentRequest {
            prompt: "Analyze spec.md".into(),
            system_prompt: Some("You are a spec analyzer.".into()),
            output_schema: Some(json!({ "type": "object", "required": ["tasks"] })),
            ..Default::default()
        };
        let body = build_body(&config, &request, "opus");
        assert_eq!(body["model"], "opus");
        assert_eq!(body["messages"][0]["content"], "Analyze spec.md");
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with("You are a spec analyzer."));
        assert!(system.contains("\"required\""));
        assert!(body["temperature"].is_number());
    }

    #[test]
    fn test_body_without_system_prompt() {
        let request = AgentRequest {
            prompt: "hi".into(),
            ..Default::default()
        };
        let body = build_body(&MessagesApiConfig::default(), &request, "m");
        assert!(body.get("system").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_parse_reply_joins_text_blocks() {
        let reply = parse_reply(
            &json!({
                "model": "claude-x",
                "stop_reason": "end_turn",
                "content": [
                    { "type": "text", "text": "first" },
                    { "type": "tool_use", "name": "Read" },
                    { "type": "text", "text": "second" }
                ],
                "usage": { "input_tokens": 10, "output_tokens": 5 }
            }),
            "fallback",
        );
        assert_eq!(reply.text, "first\nsecond");
        assert_eq!(reply.model, "claude-x");
        assert_eq!(reply.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(reply.usage.unwrap()["output_tokens"], 5);
    }
}
