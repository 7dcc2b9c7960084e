//! Memory consolidation
//!
//! Folds the older, not-yet-consolidated part of a transcript into the
//! two-layer store with a single chat call:
//!   1. Select the slice between the watermark and the live window
//!   2. Render it, together with the current long-term document, into a prompt
//!   3. Ask the model to call `save_memory` once
//!   4. Append `history_entry` to the log and, if it changed, replace the
//!      long-term document with `memory_update`
//!   5. Advance the watermark
//!
//! The watermark only moves on full success, so re-running after a failure
//! resubmits the same slice. A history entry appended before a later failure
//! stays in the log.

use super::session::SessionMessage;
use super::store::MemoryStore;
use crate::provider::{ChatMessage, ChatProvider, ToolArguments, ToolDefinition};
use crate::DEFAULT_MEMORY_WINDOW;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{json, Value};
use std::io::{self, Write};
use std::ops::Range;
use tracing::{debug, error, info, warn};

/// Name of the single tool offered during consolidation
pub const SAVE_MEMORY_TOOL: &str = "save_memory";

const SYSTEM_PROMPT: &str = "You are a memory consolidation agent. Call the save_memory tool with your consolidation of the conversation.";

const RELATIONSHIP_GUIDANCE: &str = "When relationship mode is ON, prioritize retaining user preferences, emotional cues, and personal details
that help maintain continuity in future conversations.";

/// The `save_memory` tool definition. Field names, descriptions and the
/// required list are part of the wire contract with the model.
pub fn save_memory_tool() -> ToolDefinition {
    ToolDefinition::function(
        SAVE_MEMORY_TOOL,
        "Save the memory consolidation result to persistent storage.",
        json!({
            "type": "object",
            "properties": {
                "history_entry": {
                    "type": "string",
                    "description": "A paragraph (2-5 sentences) summarizing key events/decisions/topics. Start with [YYYY-MM-DD HH:MM]. Include detail useful for grep search."
                },
                "memory_update": {
                    "type": "string",
                    "description": "Full updated long-term memory as markdown. Include all existing facts plus new ones. Return unchanged if nothing new."
                }
            },
            "required": ["history_entry", "memory_update"]
        }),
    )
}

/// What to consolidate on one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidationPolicy {
    /// Fold the whole transcript and reset the watermark to 0
    pub archive_all: bool,
    /// Recent-message window; the newest `memory_window / 2` messages are
    /// left out of consolidation
    pub memory_window: usize,
    /// Steer the model toward personal details and preferences
    pub relationship_mode: bool,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            archive_all: false,
            memory_window: DEFAULT_MEMORY_WINDOW,
            relationship_mode: false,
        }
    }
}

/// Slice chosen for one consolidation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSelection {
    /// Indices of the messages to fold
    pub range: Range<usize>,
    /// Number of newest messages left live
    pub keep_count: usize,
    /// Watermark to store once the run succeeds
    pub next_watermark: usize,
}

/// Pick the messages to consolidate, or `None` when there is nothing to do.
pub fn select_slice(
    len: usize,
    watermark: usize,
    policy: &ConsolidationPolicy,
) -> Option<SliceSelection> {
    if policy.archive_all {
        if len == 0 {
            return None;
        }
        return Some(SliceSelection {
            range: 0..len,
            keep_count: 0,
            next_watermark: 0,
        });
    }

    let keep_count = policy.memory_window / 2;
    if len <= keep_count || len.saturating_sub(watermark) == 0 {
        return None;
    }

    let end = len - keep_count;
    if watermark >= end {
        return None;
    }

    Some(SliceSelection {
        range: watermark..end,
        keep_count,
        next_watermark: end,
    })
}

/// One line per message with content:
/// `[YYYY-MM-DD HH:MM] ROLE [tools: a, b]: content`
pub fn render_messages(messages: &[SessionMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| {
            let timestamp = m
                .timestamp
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "?".to_string());
            let tools = if m.tools_used.is_empty() {
                String::new()
            } else {
                format!(" [tools: {}]", m.tools_used.join(", "))
            };
            format!(
                "[{}] {}{}: {}",
                timestamp,
                m.role.as_str().to_uppercase(),
                tools,
                m.content
            )
        })
        .collect()
}

/// The user-turn instruction sent alongside [`save_memory_tool`]
pub fn build_prompt(current_memory: &str, relationship_mode: bool, lines: &[String]) -> String {
    let memory = if current_memory.is_empty() {
        "(empty)"
    } else {
        current_memory
    };
    let mode = if relationship_mode {
        format!("ON\n\n{}", RELATIONSHIP_GUIDANCE)
    } else {
        "OFF".to_string()
    };

    format!(
        "Process this conversation and call the save_memory tool with your consolidation.

## Current Long-term Memory
{memory}

## Relationship Companion Mode
{mode}

## Conversation to Process
{}",
        lines.join("\n")
    )
}

/// Text form of a tool argument, or `None` when it is absent or empty.
///
/// Null, `false`, zero and empty strings/arrays/objects count as absent.
/// Non-string values are serialized as JSON.
pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(to_spaced_json(other)),
    }
}

/// JSON text with `", "` and `": "` separators and non-ASCII escaped as
/// `\uXXXX`, the layout most chat tooling emits for structured values.
fn to_spaced_json(value: &Value) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    match value.serialize(&mut ser) {
        Ok(()) => String::from_utf8(buf).unwrap_or_else(|_| value.to_string()),
        Err(_) => value.to_string(),
    }
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Result of one consolidation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// The model's result was committed and the watermark advanced
    Success {
        /// Messages in the consolidated slice
        consolidated: usize,
        /// Watermark after the run
        last_consolidated: usize,
        history_appended: bool,
        memory_updated: bool,
    },
    /// Nothing to consolidate; the provider was not called
    NoOp,
    /// The chat call failed or the model did not call `save_memory`
    ProviderError(String),
    /// The tool-call arguments had an unusable shape
    ParseError(String),
    /// Reading or writing the memory files failed
    PersistenceError(String),
}

impl ConsolidationOutcome {
    /// True for `Success` and `NoOp`
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ConsolidationOutcome::Success { .. } | ConsolidationOutcome::NoOp
        )
    }
}

/// Runs consolidation against one [`MemoryStore`].
///
/// Holds no locks: callers serialize runs for a given store and transcript.
pub struct Consolidator {
    store: MemoryStore,
}

impl Consolidator {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Fold the unconsolidated part of `messages` into memory.
    ///
    /// `last_consolidated` is read to select the slice and written only on
    /// success. Exactly one provider call is made unless the run is a no-op.
    pub async fn consolidate(
        &self,
        messages: &[SessionMessage],
        last_consolidated: &mut usize,
        provider: &dyn ChatProvider,
        model: &str,
        policy: &ConsolidationPolicy,
    ) -> ConsolidationOutcome {
        let Some(selection) = select_slice(messages.len(), *last_consolidated, policy) else {
            debug!(
                "Memory consolidation: nothing to do ({} messages, last_consolidated={})",
                messages.len(),
                *last_consolidated
            );
            return ConsolidationOutcome::NoOp;
        };

        let slice = &messages[selection.range.clone()];
        if policy.archive_all {
            info!("Memory consolidation (archive_all): {} messages", messages.len());
        } else {
            info!(
                "Memory consolidation: {} to consolidate, {} keep",
                slice.len(),
                selection.keep_count
            );
        }

        let lines = render_messages(slice);
        debug!("Rendered {} of {} messages", lines.len(), slice.len());

        let current_memory = match self.store.read_long_term().await {
            Ok(memory) => memory,
            Err(e) => {
                error!("Memory consolidation failed reading memory: {}", e);
                return ConsolidationOutcome::PersistenceError(e.to_string());
            }
        };

        let prompt = build_prompt(&current_memory, policy.relationship_mode, &lines);
        let request = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

        let response = match provider.chat(&request, &[save_memory_tool()], model).await {
            Ok(response) => response,
            Err(e) => {
                error!("Memory consolidation failed: {}", e);
                return ConsolidationOutcome::ProviderError(e.to_string());
            }
        };

        let Some(call) = response.tool_calls.into_iter().next() else {
            warn!("Memory consolidation: LLM did not call save_memory, skipping");
            return ConsolidationOutcome::ProviderError(
                "model did not call save_memory".to_string(),
            );
        };
        if call.name != SAVE_MEMORY_TOOL {
            warn!(
                "Memory consolidation: expected {} but model called {}",
                SAVE_MEMORY_TOOL, call.name
            );
        }

        let args = match ToolArguments::try_from(call.arguments).and_then(ToolArguments::into_mapping)
        {
            Ok(args) => args,
            Err(e) => {
                warn!("Memory consolidation: {}", e);
                return ConsolidationOutcome::ParseError(e.to_string());
            }
        };

        let mut history_appended = false;
        if let Some(entry) = args.get("history_entry").and_then(coerce_text) {
            if let Err(e) = self.store.append_history(&entry).await {
                error!("Memory consolidation failed appending history: {}", e);
                return ConsolidationOutcome::PersistenceError(e.to_string());
            }
            history_appended = true;
        }

        let mut memory_updated = false;
        if let Some(update) = args.get("memory_update").and_then(coerce_text) {
            if update != current_memory {
                // The history entry above is already committed; a failure
                // here leaves it describing an update that never landed.
                if let Err(e) = self.store.write_long_term(&update).await {
                    error!("Memory consolidation failed writing memory: {}", e);
                    return ConsolidationOutcome::PersistenceError(e.to_string());
                }
                memory_updated = true;
            }
        }

        *last_consolidated = selection.next_watermark;
        info!(
            "Memory consolidation done: {} messages, last_consolidated={}",
            messages.len(),
            *last_consolidated
        );

        ConsolidationOutcome::Success {
            consolidated: slice.len(),
            last_consolidated: *last_consolidated,
            history_appended,
            memory_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn policy(window: usize) -> ConsolidationPolicy {
        ConsolidationPolicy {
            memory_window: window,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_slice_window() {
        let selection = select_slice(60, 0, &policy(50)).unwrap();
        assert_eq!(selection.range, 0..35);
        assert_eq!(selection.keep_count, 25);
        assert_eq!(selection.next_watermark, 35);

        let selection = select_slice(60, 30, &policy(50)).unwrap();
        assert_eq!(selection.range, 30..35);
    }

    #[test]
    fn test_select_slice_noop_cases() {
        // Shorter than the kept window
        assert_eq!(select_slice(20, 0, &policy(50)), None);
        assert_eq!(select_slice(25, 0, &policy(50)), None);
        // Everything already consolidated
        assert_eq!(select_slice(60, 60, &policy(50)), None);
        // Watermark inside the kept window
        assert_eq!(select_slice(60, 40, &policy(50)), None);
        // Watermark past the end
        assert_eq!(select_slice(60, 99, &policy(50)), None);
    }

    #[test]
    fn test_select_slice_small_window_keeps_nothing() {
        let selection = select_slice(3, 1, &policy(1)).unwrap();
        assert_eq!(selection.range, 1..3);
        assert_eq!(selection.keep_count, 0);
        assert_eq!(selection.next_watermark, 3);
    }

    #[test]
    fn test_select_slice_archive_all() {
        let archive = ConsolidationPolicy {
            archive_all: true,
            ..Default::default()
        };
        let selection = select_slice(10, 8, &archive).unwrap();
        assert_eq!(selection.range, 0..10);
        assert_eq!(selection.next_watermark, 0);
        assert_eq!(select_slice(0, 0, &archive), None);
    }

    #[test]
    fn test_render_messages() {
        let ts = NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(9, 26, 53)
            .unwrap();
        let messages = vec![
            SessionMessage::new(Role::User, "find flights").with_timestamp(ts),
            SessionMessage::new(Role::Assistant, "")
                .with_timestamp(ts)
                .with_tools(vec!["search".to_string()]),
            SessionMessage::new(Role::Assistant, "found two")
                .with_timestamp(ts)
                .with_tools(vec!["search".to_string(), "calendar".to_string()]),
            SessionMessage {
                role: Role::Tool,
                content: "raw".to_string(),
                timestamp: None,
                tools_used: Vec::new(),
            },
        ];

        assert_eq!(
            render_messages(&messages),
            vec![
                "[2025-03-14 09:26] USER: find flights".to_string(),
                "[2025-03-14 09:26] ASSISTANT [tools: search, calendar]: found two".to_string(),
                "[?] TOOL: raw".to_string(),
            ]
        );
    }

    #[test]
    fn test_build_prompt_empty_memory_mode_off() {
        let prompt = build_prompt("", false, &["[?] USER: hi".to_string()]);
        assert_eq!(
            prompt,
            "Process this conversation and call the save_memory tool with your consolidation.

## Current Long-term Memory
(empty)

## Relationship Companion Mode
OFF

## Conversation to Process
[?] USER: hi"
        );
    }

    #[test]
    fn test_build_prompt_mode_on() {
        let prompt = build_prompt("# Long-term Memory\n- likes tea", true, &[]);
        assert!(prompt.contains("## Current Long-term Memory\n# Long-term Memory\n- likes tea\n"));
        assert!(prompt.contains("## Relationship Companion Mode\nON\n\nWhen relationship mode is ON"));
        assert!(prompt.contains("emotional cues"));
    }

    #[test]
    fn test_save_memory_tool_contract() {
        let tool = serde_json::to_value(save_memory_tool()).unwrap();
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "save_memory");
        assert_eq!(
            tool["function"]["parameters"]["required"],
            json!(["history_entry", "memory_update"])
        );
        assert_eq!(
            tool["function"]["parameters"]["properties"]["history_entry"]["type"],
            "string"
        );
        assert_eq!(
            tool["function"]["parameters"]["properties"]["memory_update"]["type"],
            "string"
        );
    }

    #[test]
    fn test_coerce_text() {
        assert_eq!(coerce_text(&json!("entry")), Some("entry".to_string()));
        assert_eq!(coerce_text(&json!("")), None);
        assert_eq!(coerce_text(&Value::Null), None);
        assert_eq!(coerce_text(&json!(false)), None);
        assert_eq!(coerce_text(&json!(0)), None);
        assert_eq!(coerce_text(&json!([])), None);
        assert_eq!(coerce_text(&json!({})), None);
        assert_eq!(coerce_text(&json!(["a", "b"])), Some(r#"["a", "b"]"#.to_string()));
        assert_eq!(
            coerce_text(&json!({"k": "é", "n": [1, {"x": null}]})),
            Some(r#"{"k": "\u00e9", "n": [1, {"x": null}]}"#.to_string())
        );
        assert_eq!(coerce_text(&json!(["🙂"])), Some(r#"["\ud83d\ude42"]"#.to_string()));
        assert_eq!(coerce_text(&json!("say \"hi\"\n")), Some("say \"hi\"\n".to_string()));
        assert_eq!(coerce_text(&json!(true)), Some("true".to_string()));
    }

    #[test]
    fn test_outcome_is_success() {
        assert!(ConsolidationOutcome::NoOp.is_success());
        assert!(ConsolidationOutcome::Success {
            consolidated: 1,
            last_consolidated: 1,
            history_appended: true,
            memory_updated: false,
        }
        .is_success());
        assert!(!ConsolidationOutcome::ProviderError("x".into()).is_success());
        assert!(!ConsolidationOutcome::ParseError("x".into()).is_success());
        assert!(!ConsolidationOutcome::PersistenceError("x".into()).is_success());
    }
}
