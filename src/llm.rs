//! LLM client (OpenAI-compatible chat completions)
//!
//! One client covers every model call in the pipeline: streamed turn
//! replies, single-shot translation, workflow classifiers with strict output
//! contracts, and the customer-flow tool calls.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

/// A chat message in provider wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Result of a dispatched tool, echoed back to the model
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Tool definition for OpenAI-compatible function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool call returned by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub r#type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// Arguments arrive as either a JSON string or a raw object depending
    /// on the model; normalized to a string for downstream use.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    pub arguments: String,
}

fn deserialize_arguments<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawArguments {
        Text(String),
        Structured(serde_json::Value),
    }

    Ok(match RawArguments::deserialize(deserializer)? {
        RawArguments::Text(text) => text,
        RawArguments::Structured(serde_json::Value::Null) => String::new(),
        RawArguments::Structured(value) => value.to_string(),
    })
}

/// Assistant turn that may carry tool calls instead of (or alongside) text
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// One `data:` event of a streamed completion
#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completions client
#[derive(Clone)]
pub struct LlmClient {
    client: Arc<Client>,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client: Arc::new(client),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request(&self) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    /// Single-shot completion, returns the assistant text
    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            stream: None,
            tools: None,
            tool_choice: None,
        };

        let response = self
            .request()
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        Ok(extract_content(&raw))
    }

    /// Completion with bound tools; the assistant turn may carry tool calls
    pub async fn complete_with_tools(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<AssistantTurn> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            stream: None,
            tools: Some(tools),
            tool_choice: Some("auto".to_string()),
        };

        let response = self
            .request()
            .json(&request)
            .send()
            .await
            .context("Failed to send tool request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM tool response")?;

        let message = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .cloned()
            .unwrap_or_default();

        let tool_calls: Vec<ToolCall> = message
            .get("tool_calls")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();

        Ok(AssistantTurn {
            content: extract_content(&raw),
            tool_calls,
        })
    }

    /// Streamed completion; `on_chunk` fires for each text delta.
    /// Returns the full assembled reply.
    pub async fn stream_complete(
        &self,
        messages: Vec<ChatMessage>,
        mut on_chunk: impl FnMut(&str) + Send,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            stream: Some(true),
            tools: None,
            tool_choice: None,
        };

        let response = self
            .request()
            .json(&request)
            .send()
            .await
            .context("Failed to send streaming request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM streaming API error ({}): {}", status, body);
        }

        // The body is SSE. Every meaningful event is a single `data:` line,
        // so parse line by line; whatever trails the last newline stays in
        // `pending` until the next network chunk completes it.
        let mut body = response.bytes_stream();
        let mut full_reply = String::new();
        let mut pending = String::new();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Failed to read stream chunk")?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let Some(payload) = line.trim_end().strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim_start();
                if payload == "[DONE]" {
                    break 'read;
                }
                match serde_json::from_str::<ChatStreamChunk>(payload) {
                    Ok(event) => {
                        let text = event
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.as_deref())
                            .unwrap_or("");
                        if !text.is_empty() {
                            on_chunk(text);
                            full_reply.push_str(text);
                        }
                    }
                    Err(e) => debug!("Skipping malformed stream event: {}", e),
                }
            }
        }

        Ok(full_reply)
    }
}

/// Extract assistant text from a completions response, tolerating both
/// string content and array-of-content-parts formats.
fn extract_content(raw: &serde_json::Value) -> String {
    let content = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"));

    match content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_string_content() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(extract_content(&raw), "hello");
    }

    #[test]
    fn test_extract_content_parts() {
        let raw = serde_json::json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "hel"},
                {"type": "text", "text": "lo"}
            ]}}]
        });
        assert_eq!(extract_content(&raw), "hello");
    }

    #[test]
    fn test_extract_missing_content_is_empty() {
        let raw = serde_json::json!({"choices": []});
        assert_eq!(extract_content(&raw), "");
    }

    #[test]
    fn test_tool_arguments_accept_object_form() {
        let call: ToolCall = serde_json::from_value(serde_json::json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "select_wait_option", "arguments": {"confirm": true}}
        }))
        .unwrap();
        assert_eq!(call.function.name, "select_wait_option");
        assert!(call.function.arguments.contains("confirm"));
    }

    #[test]
    fn test_tool_arguments_accept_string_form() {
        let call: ToolCall = serde_json::from_value(serde_json::json!({
            "id": "call_2",
            "type": "function",
            "function": {"name": "decline_both_options", "arguments": "{}"}
        }))
        .unwrap();
        assert_eq!(call.function.arguments, "{}");
    }

    #[test]
    fn test_stream_chunk_parses_delta() {
        let chunk: ChatStreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));

        let tail: ChatStreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert!(tail.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::system("x").role, "system");
        assert_eq!(ChatMessage::user("x").role, "user");
        assert_eq!(ChatMessage::assistant("x").role, "assistant");
        let tool = ChatMessage::tool_result("call_1", "done");
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }
}
