//! Keepsake - durable memory for conversational agents
//!
//! Keeps two layers of memory on disk for an agent whose context window is
//! bounded:
//! - A long-term markdown document of facts (`memory/MEMORY.md`)
//! - An append-only, grep-searchable history log (`memory/HISTORY.md`)
//!
//! Facts are mined from user messages as they arrive, and older parts of a
//! conversation are periodically folded into both layers through a single
//! `save_memory` tool call to a chat model.

pub mod bridge;
pub mod config;
pub mod memory;
pub mod provider;

pub use memory::{
    ConsolidationOutcome, ConsolidationPolicy, Consolidator, FactExtractor, MemoryStore, Session,
    SessionStore,
};
pub use provider::{ChatProvider, ChatResponse, OpenAiProvider};

use std::collections::HashMap;
use std::path::PathBuf;

/// Default chat model used for consolidation
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default number of recent messages kept live in context
pub const DEFAULT_MEMORY_WINDOW: usize = 50;

/// Default OpenAI-compatible endpoint
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Configuration for Keepsake
#[derive(Debug, Clone)]
pub struct KeepsakeConfig {
    /// Workspace directory holding `memory/` and `sessions/`
    pub workspace: PathBuf,

    /// Model used for consolidation calls
    pub model: String,

    /// Number of most-recent messages excluded from consolidation (halved)
    pub memory_window: usize,

    /// Steer consolidation toward personal details and preferences
    pub relationship_mode: bool,

    /// Chat provider connection settings
    pub provider: ProviderConfig,
}

/// Connection settings for an OpenAI-compatible chat endpoint
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub api_base: String,

    /// Bearer token; local servers may not need one
    pub api_key: Option<String>,

    /// Additional static HTTP headers
    pub extra_headers: HashMap<String, String>,

    /// Transport timeout for a single request, in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            extra_headers: HashMap::new(),
            timeout_secs: 120,
        }
    }
}

impl KeepsakeConfig {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            model: DEFAULT_MODEL.to_string(),
            memory_window: DEFAULT_MEMORY_WINDOW,
            relationship_mode: false,
            provider: ProviderConfig::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_memory_window(mut self, window: usize) -> Self {
        self.memory_window = window;
        self
    }

    pub fn with_relationship_mode(mut self, enabled: bool) -> Self {
        self.relationship_mode = enabled;
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    /// Directory holding MEMORY.md and HISTORY.md
    pub fn memory_dir(&self) -> PathBuf {
        self.workspace.join("memory")
    }

    /// Directory holding persisted transcripts
    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace.join("sessions")
    }

    /// Consolidation policy derived from this configuration
    pub fn policy(&self, archive_all: bool) -> ConsolidationPolicy {
        ConsolidationPolicy {
            archive_all,
            memory_window: self.memory_window,
            relationship_mode: self.relationship_mode,
        }
    }
}

/// Result type for Keepsake operations
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Errors that can occur in Keepsake
#[derive(Debug, thiserror::Error)]
pub enum KeepsakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Chat provider error: {0}")]
    Provider(String),

    #[error("Malformed tool arguments: {0}")]
    ToolArguments(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Session key collision: {0}")]
    SessionKey(String),
}
