//! Chat-completion provider abstraction.
//!
//! The model is a black box: conversation + tool specs in, one assistant
//! message out, optionally carrying tool calls. [`OpenAiChat`] talks to the
//! OpenAI chat completions API; the streamed variant forwards content
//! deltas to a channel as they arrive so the agent loop can surface
//! incremental progress.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::models::{Message, Role, ToolCall};

/// Wire-level description of a tool offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema (`type: "object"`) for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A black-box messages-to-message function with tool calling.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// One model turn over the full conversation.
    async fn complete(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<Message>;

    /// Like [`complete`](ChatProvider::complete), but forwards incremental
    /// content to `tokens` as it is produced. The default implementation
    /// emits the whole content as a single token, which is what mock
    /// providers want.
    async fn complete_streamed(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        tokens: mpsc::Sender<String>,
    ) -> Result<Message> {
        let message = self.complete(messages, tools).await?;
        if !message.content.is_empty() {
            let _ = tokens.send(message.content.clone()).await;
        }
        Ok(message)
    }
}

// ============ OpenAI provider ============

/// Chat provider backed by `POST /v1/chat/completions`.
///
/// Requires `OPENAI_API_KEY` in the environment. Retry policy matches the
/// embedding provider: 429/5xx and network errors retry with exponential
/// backoff, other 4xx fail immediately.
pub struct OpenAiChat {
    model: String,
    temperature: f64,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }

    fn request_body(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> =
            messages.iter().map(message_to_wire).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": wire_messages,
        });

        if !tools.is_empty() {
            let wire_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(wire_tools);
        }

        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }

        body
    }

    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat completion failed after retries")))
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    async fn complete(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<Message> {
        let body = self.request_body(messages, tools, false);
        let response = self.send_with_retry(&body).await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    async fn complete_streamed(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        tokens: mpsc::Sender<String>,
    ) -> Result<Message> {
        let body = self.request_body(messages, tools, true);
        let mut response = self.send_with_retry(&body).await?;

        let mut buffer = String::new();
        let mut content = String::new();
        // tool call fragments accumulated by stream index: (id, name, raw args)
        let mut partial_calls: Vec<(String, String, String)> = Vec::new();

        while let Some(chunk) = response.chunk().await? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }

                let Ok(frame) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                let delta = &frame["choices"][0]["delta"];

                if let Some(text) = delta["content"].as_str() {
                    content.push_str(text);
                    if tokens.send(text.to_string()).await.is_err() {
                        // Consumer went away; keep draining so the final
                        // message (and any tool calls) stays complete.
                    }
                }

                if let Some(calls) = delta["tool_calls"].as_array() {
                    for call in calls {
                        let index = call["index"].as_u64().unwrap_or(0) as usize;
                        while partial_calls.len() <= index {
                            partial_calls.push((String::new(), String::new(), String::new()));
                        }
                        let slot = &mut partial_calls[index];
                        if let Some(id) = call["id"].as_str() {
                            slot.0.push_str(id);
                        }
                        if let Some(name) = call["function"]["name"].as_str() {
                            slot.1.push_str(name);
                        }
                        if let Some(args) = call["function"]["arguments"].as_str() {
                            slot.2.push_str(args);
                        }
                    }
                }
            }
        }

        let tool_calls = partial_calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, raw_args)| {
                let arguments = parse_arguments(&raw_args);
                ToolCall {
                    id,
                    name,
                    arguments,
                }
            })
            .collect();

        Ok(Message::assistant(content, tool_calls))
    }
}

/// Serialize one conversation message into the chat completions format.
fn message_to_wire(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = serde_json::json!({
        "role": role,
        "content": message.content,
    });

    if !message.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    }
                })
            })
            .collect();
        wire["tool_calls"] = serde_json::Value::Array(calls);
    }

    if let Some(ref id) = message.tool_call_id {
        wire["tool_call_id"] = serde_json::Value::String(id.clone());
    }

    wire
}

/// Parse a non-streamed completion response into an assistant message.
fn parse_completion(json: &serde_json::Value) -> Result<Message> {
    let message = json["choices"]
        .get(0)
        .map(|c| &c["message"])
        .context("Invalid completion response: missing choices")?;

    let content = message["content"].as_str().unwrap_or("").to_string();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let name = c["function"]["name"].as_str()?;
                    Some(ToolCall {
                        id: c["id"].as_str().unwrap_or("").to_string(),
                        name: name.to_string(),
                        arguments: parse_arguments(
                            c["function"]["arguments"].as_str().unwrap_or("{}"),
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Message::assistant(content, tool_calls))
}

/// Tool arguments arrive as a JSON string. Malformed payloads are kept as
/// raw text so parameter validation can reject them with a useful message.
fn parse_arguments(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::json!({ "_raw": raw }))
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(config: &ChatConfig) -> Result<Box<dyn ChatProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let json = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "run_sql",
                            "arguments": "{\"question\": \"list orders\"}"
                        }
                    }]
                }
            }]
        });
        let message = parse_completion(&json).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].name, "run_sql");
        assert_eq!(message.tool_calls[0].arguments["question"], "list orders");
    }

    #[test]
    fn test_parse_completion_plain_answer() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "the answer" } }]
        });
        let message = parse_completion(&json).unwrap();
        assert_eq!(message.content, "the answer");
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn test_malformed_arguments_preserved_as_raw() {
        let value = parse_arguments("not json");
        assert_eq!(value["_raw"], "not json");
    }

    #[test]
    fn test_message_to_wire_tool_message() {
        let msg = Message::tool("rows: 3", "call_9");
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }
}
