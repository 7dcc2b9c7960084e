//! Chat provider abstraction
//!
//! The consolidation workflow talks to a language model through the
//! [`ChatProvider`] trait only. [`OpenAiProvider`] is the bundled
//! implementation for OpenAI-compatible Chat Completions endpoints.

mod openai;

pub use openai::OpenAiProvider;

use crate::{KeepsakeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a chat or transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message sent to the chat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A function tool offered to the model, in Chat Completions wire shape:
/// `{"type": "function", "function": {name, description, parameters}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is kept exactly as the provider produced it. Most providers
/// send a JSON-encoded string, some send an object; resolve it with
/// [`ToolArguments::try_from`] before use.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Reply from a chat call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    /// Assistant text, if any
    pub content: Option<String>,
    /// Tool invocations, in the order the model produced them
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    /// Text-only reply
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Reply carrying a single tool call
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: "call_0".to_string(),
                name: name.into(),
                arguments,
            }],
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Tool-call arguments in either of the shapes providers use
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    /// Already-structured JSON object
    Mapping(Map<String, Value>),
    /// JSON object serialized into a string
    Encoded(String),
}

impl TryFrom<Value> for ToolArguments {
    type Error = KeepsakeError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(ToolArguments::Mapping(map)),
            Value::String(raw) => Ok(ToolArguments::Encoded(raw)),
            other => Err(KeepsakeError::ToolArguments(format!(
                "expected object or string, got {}",
                value_kind(&other)
            ))),
        }
    }
}

impl ToolArguments {
    /// Resolve to a single mapping, decoding the string form
    pub fn into_mapping(self) -> Result<Map<String, Value>> {
        match self {
            ToolArguments::Mapping(map) => Ok(map),
            ToolArguments::Encoded(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(KeepsakeError::ToolArguments(format!(
                    "encoded arguments decode to {}, not an object",
                    value_kind(&other)
                ))),
                Err(e) => Err(KeepsakeError::ToolArguments(format!(
                    "encoded arguments are not valid JSON: {}",
                    e
                ))),
            },
        }
    }
}

/// JSON type name, for error messages
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A chat-completion capability with tool calling.
///
/// Implementations make exactly one request per call: no retries and no
/// streaming. Deadlines belong to the caller.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ChatResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_definition_wire_shape() {
        let tool = ToolDefinition::function("ping", "Ping it", json!({"type": "object"}));
        assert_eq!(
            serde_json::to_value(&tool).unwrap(),
            json!({
                "type": "function",
                "function": {
                    "name": "ping",
                    "description": "Ping it",
                    "parameters": {"type": "object"}
                }
            })
        );
    }

    #[test]
    fn test_arguments_mapping_and_encoded() {
        let mapped = ToolArguments::try_from(json!({"a": 1})).unwrap();
        assert_eq!(mapped.into_mapping().unwrap()["a"], json!(1));

        let encoded = ToolArguments::try_from(json!("{\"a\": \"x\"}")).unwrap();
        assert!(matches!(encoded, ToolArguments::Encoded(_)));
        assert_eq!(encoded.into_mapping().unwrap()["a"], json!("x"));
    }

    #[test]
    fn test_arguments_rejects_other_shapes() {
        assert!(ToolArguments::try_from(json!([1, 2])).is_err());
        assert!(ToolArguments::try_from(Value::Null).is_err());
        assert!(ToolArguments::try_from(json!(3)).is_err());

        let err = ToolArguments::Encoded("[1, 2]".to_string())
            .into_mapping()
            .unwrap_err();
        assert!(err.to_string().contains("array"));

        let err = ToolArguments::Encoded("{not json".to_string())
            .into_mapping()
            .unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), json!("assistant"));
        let role: Role = serde_json::from_value(json!("tool")).unwrap();
        assert_eq!(role, Role::Tool);
        assert_eq!(Role::User.to_string(), "user");
    }

    #[test]
    fn test_has_tool_calls() {
        assert!(!ChatResponse::text("hi").has_tool_calls());
        assert!(ChatResponse::tool_call("save_memory", json!({})).has_tool_calls());
    }
}
