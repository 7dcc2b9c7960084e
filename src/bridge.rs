//! JSON-lines bridge over stdio
//!
//! One request per line on the input:
//!   `{"id": "1", "type": "capture", "payload": {"text": "..."}}`
//! One response per line on the output:
//!   `{"id": "1", "ok": true, "payload": {...}}` or
//!   `{"id": "1", "ok": false, "error": "..."}`
//!
//! A `{"type": "ready"}` line is written before the first request is read.
//! Requests are handled one at a time, which also serializes consolidation
//! runs against the store.

use crate::memory::{
    ConsolidationOutcome, Consolidator, FactExtractor, MemoryStore, SessionMessage, SessionStore,
};
use crate::provider::{ChatProvider, Role};
use crate::{KeepsakeConfig, KeepsakeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Session used when a request does not name one
pub const DEFAULT_SESSION: &str = "overlay:default";

/// A parsed bridge request
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRequest {
    pub id: String,
    pub req_type: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Value,
    #[serde(rename = "type", default)]
    req_type: Value,
    #[serde(default)]
    payload: Value,
}

/// Response envelope written back for each request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeResponse {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse one request line. `id` and `type` are required; a non-object
/// payload is treated as empty.
pub fn parse_request(line: &str) -> Result<BridgeRequest> {
    let raw: RawRequest = serde_json::from_str(line)?;
    let id = scalar_to_string(&raw.id);
    let req_type = scalar_to_string(&raw.req_type);
    if id.is_empty() || req_type.is_empty() {
        return Err(KeepsakeError::BadRequest(
            "Request must include 'id' and 'type'".to_string(),
        ));
    }
    let payload = match raw.payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(BridgeRequest {
        id,
        req_type,
        payload,
    })
}

/// Best-effort id recovery for requests that failed to parse or handle
fn request_id(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").map(scalar_to_string))
        .unwrap_or_default()
}

fn payload_str<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

fn payload_session(payload: &Map<String, Value>) -> String {
    payload_str(payload, "session")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION)
        .to_string()
}

fn outcome_payload(outcome: &ConsolidationOutcome, last_consolidated: usize) -> Value {
    let (status, error) = match outcome {
        ConsolidationOutcome::Success { .. } => ("success", None),
        ConsolidationOutcome::NoOp => ("noop", None),
        ConsolidationOutcome::ProviderError(e) => ("provider_error", Some(e)),
        ConsolidationOutcome::ParseError(e) => ("parse_error", Some(e)),
        ConsolidationOutcome::PersistenceError(e) => ("persistence_error", Some(e)),
    };
    let mut payload = json!({
        "success": outcome.is_success(),
        "status": status,
        "last_consolidated": last_consolidated,
    });
    if let Some(error) = error {
        payload["error"] = json!(error);
    }
    payload
}

/// Serves memory operations to a front end over a line-based channel
pub struct Bridge {
    config: KeepsakeConfig,
    extractor: FactExtractor,
    consolidator: Consolidator,
    sessions: SessionStore,
    provider: Arc<dyn ChatProvider>,
}

impl Bridge {
    pub async fn new(config: KeepsakeConfig, provider: Arc<dyn ChatProvider>) -> Result<Self> {
        let store = MemoryStore::new(&config.workspace);
        let sessions = SessionStore::new(&config.workspace).await?;
        Ok(Self {
            extractor: FactExtractor::new(store.clone()),
            consolidator: Consolidator::new(store),
            sessions,
            provider,
            config,
        })
    }

    /// Handle one request and return its response payload
    pub async fn handle(&self, request: &BridgeRequest) -> Result<Value> {
        let payload = &request.payload;
        match request.req_type.as_str() {
            "health" => Ok(json!({ "ok": true })),

            "remember" => {
                let fact = payload_str(payload, "fact").unwrap_or_default();
                let saved = self.extractor.remember_fact(fact).await?;
                Ok(json!({ "saved": saved }))
            }

            "capture" => {
                let text = payload_str(payload, "text").unwrap_or_default().trim();
                if text.is_empty() {
                    return Ok(json!({ "saved": 0 }));
                }
                let saved = self.extractor.capture_from_user_message(text).await?;
                if payload.contains_key("session") {
                    let key = payload_session(payload);
                    let mut session = self.sessions.get_or_create(&key).await?;
                    session.add_message(Role::User, text, Vec::new());
                    self.sessions.save(&session).await?;
                }
                Ok(json!({ "saved": saved }))
            }

            "append" => {
                let key = payload_session(payload);
                let role: Role = match payload.get("role") {
                    Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                        KeepsakeError::BadRequest(format!("Unknown role: {}", value))
                    })?,
                    None => Role::User,
                };
                let content = payload_str(payload, "content").unwrap_or_default();
                let tools_used = payload
                    .get("tools_used")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();

                let mut session = self.sessions.get_or_create(&key).await?;
                session.push(SessionMessage::new(role, content).with_tools(tools_used));
                self.sessions.save(&session).await?;
                Ok(json!({ "messages": session.len() }))
            }

            "context" => {
                let context = self.extractor.store().get_memory_context().await?;
                Ok(json!({ "context": context }))
            }

            "history" => {
                let store = self.extractor.store();
                let entries = match payload_str(payload, "query").filter(|q| !q.trim().is_empty()) {
                    Some(query) => store.search_history(query).await?,
                    None => store.read_history().await?,
                };
                Ok(json!({ "entries": entries }))
            }

            "consolidate" => {
                let key = payload_session(payload);
                let archive_all = payload
                    .get("archive_all")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let mut session = self.sessions.get_or_create(&key).await?;
                let outcome = self
                    .consolidator
                    .consolidate(
                        &session.messages,
                        &mut session.last_consolidated,
                        self.provider.as_ref(),
                        &self.config.model,
                        &self.config.policy(archive_all),
                    )
                    .await;
                if matches!(outcome, ConsolidationOutcome::Success { .. }) {
                    self.sessions.save(&session).await?;
                }
                Ok(outcome_payload(&outcome, session.last_consolidated))
            }

            other => Err(KeepsakeError::BadRequest(format!(
                "Unsupported request type: {}",
                other
            ))),
        }
    }

    /// Process one raw line into a response
    pub async fn handle_line(&self, line: &str) -> BridgeResponse {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(e) => return BridgeResponse::failure(request_id(line), e.to_string()),
        };

        debug!("Bridge request {} ({})", request.id, request.req_type);
        match self.handle(&request).await {
            Ok(payload) => BridgeResponse::success(request.id, payload),
            Err(e) => {
                warn!("Bridge request {} failed: {}", request.id, e);
                BridgeResponse::failure(request.id, e.to_string())
            }
        }
    }

    /// Read requests until EOF, writing one response line per request
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        emit(&mut writer, &json!({ "type": "ready" })).await?;
        info!("Bridge ready (workspace {:?})", self.config.workspace);

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let response = self.handle_line(raw).await;
            emit(&mut writer, &serde_json::to_value(&response)?).await?;
        }

        info!("Bridge input closed");
        Ok(())
    }
}

async fn emit<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
