//! OpenAI-compatible Chat Completions provider
//!
//! Sends one `POST {api_base}/chat/completions` per call with the offered
//! tools and `tool_choice: "auto"`. Works against api.openai.com and local
//! servers speaking the same wire format (Ollama, LM Studio, vLLM).

use super::{ChatMessage, ChatProvider, ChatResponse, ToolCallRequest, ToolDefinition};
use crate::{KeepsakeError, ProviderConfig, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const MAX_TOKENS: u32 = 4096;
const TEMPERATURE: f32 = 0.1;
const MAX_ERROR_DETAIL_CHARS: usize = 500;

// ─── Chat Completions API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "is_empty_slice")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// Normally a JSON-encoded string; some servers send an object
    #[serde(default)]
    arguments: serde_json::Value,
}

impl From<WireResponse> for ChatResponse {
    fn from(wire: WireResponse) -> Self {
        let Some(choice) = wire.choices.into_iter().next() else {
            return ChatResponse::default();
        };

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        ChatResponse {
            content: choice.message.content,
            tool_calls,
            finish_reason: choice.finish_reason,
        }
    }
}

// ─── Provider ───────────────────────────────────────────────────────

/// Chat provider for OpenAI-compatible endpoints
pub struct OpenAiProvider {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("keepsake/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeepsakeError::Provider(format!("failed to build HTTP client: {e}")))?;

        let extra_headers = config
            .extra_headers
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(name, value)| (name.clone(), value.trim().to_string()))
            .collect();

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            extra_headers,
        })
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = truncate_error_detail(&extract_error_detail(&body), MAX_ERROR_DETAIL_CHARS);
        if detail.is_empty() {
            return Err(KeepsakeError::Provider(format!("API error {status}")));
        }
        Err(KeepsakeError::Provider(format!("API error {status}: {detail}")))
    }

    fn map_reqwest_error(e: reqwest::Error) -> KeepsakeError {
        if e.is_timeout() {
            KeepsakeError::Provider(format!("timeout: {e}"))
        } else if e.is_connect() {
            KeepsakeError::Provider(format!("network: {e}"))
        } else {
            KeepsakeError::Provider(e.to_string())
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatRequest {
            model,
            messages,
            tools,
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            stream: false,
        };

        debug!(
            "Chat request: model={}, messages={}, tools={}",
            model,
            messages.len(),
            tools.len()
        );

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        for (name, value) in &self.extra_headers {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder
            .json(&request)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let response = Self::check_response_status(response).await?;

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| KeepsakeError::Provider(format!("invalid response body: {e}")))?;

        Ok(wire.into())
    }
}

/// Pull a human-readable message out of an error body
fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}
