//! Conversation transcripts and their on-disk store.
//!
//! A [`Session`] is the ordered message list of one conversation plus the
//! consolidation watermark (`last_consolidated`): the index up to which
//! messages have already been folded into long-term memory. Each session is
//! saved to `sessions/{key}.json` under the workspace.

use crate::provider::Role;
use crate::{KeepsakeError, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One transcript message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: String,
    /// Local wall-clock time the message was recorded
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    /// Names of tools the assistant used while producing this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
}

impl SessionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Local::now().naive_local()),
            tools_used: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_used = tools;
        self
    }
}

/// A conversation transcript with its consolidation watermark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    /// Messages before this index are already folded into memory.
    /// Only the consolidator writes it.
    #[serde(default)]
    pub last_consolidated: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            last_consolidated: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message stamped with the current local time
    pub fn add_message(&mut self, role: Role, content: impl Into<String>, tools_used: Vec<String>) {
        self.push(SessionMessage::new(role, content).with_tools(tools_used));
    }

    pub fn push(&mut self, message: SessionMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages not yet folded into memory
    pub fn unconsolidated(&self) -> &[SessionMessage] {
        self.messages.get(self.last_consolidated..).unwrap_or(&[])
    }
}

#[derive(Deserialize)]
struct StoredKey {
    key: String,
}

/// Key recorded in an existing session file, if it can be read
async fn stored_key(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).await.ok()?;
    serde_json::from_str::<StoredKey>(&content)
        .ok()
        .map(|stored| stored.key)
}

/// Manages per-session transcript files.
///
/// Directory layout:
///   {workspace}/sessions/{key}.json
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Create a session store. Creates the directory if needed.
    pub async fn new(workspace: &Path) -> Result<Self> {
        let sessions_dir = workspace.join("sessions");
        fs::create_dir_all(&sessions_dir).await?;
        Ok(Self { sessions_dir })
    }

    /// Save a session, replacing any previous file for its key
    ///
    /// Distinct keys can sanitize to the same file name; saving over a file
    /// that belongs to another key is refused.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.key);
        if let Some(owner) = stored_key(&path).await {
            if owner != session.key {
                return Err(KeepsakeError::SessionKey(format!(
                    "'{}' maps to the file of session '{}'",
                    session.key, owner
                )));
            }
        }
        let content = serde_json::to_string_pretty(session)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!(
            "Saved session {} ({} messages, last_consolidated={})",
            session.key,
            session.len(),
            session.last_consolidated
        );
        Ok(())
    }

    /// Load a saved session. Returns None if no file exists or it cannot be
    /// parsed.
    pub async fn load(&self, key: &str) -> Result<Option<Session>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<Session>(&content) {
            Ok(session) if session.key != key => {
                warn!(
                    "Session file for {} belongs to session {}, ignoring",
                    key, session.key
                );
                Ok(None)
            }
            Ok(mut session) => {
                if session.last_consolidated > session.len() {
                    warn!(
                        "Session {} watermark {} past end ({} messages), clamping",
                        key,
                        session.last_consolidated,
                        session.len()
                    );
                    session.last_consolidated = session.len();
                }
                info!("Loaded session {} ({} messages)", key, session.len());
                Ok(Some(session))
            }
            Err(e) => {
                warn!("Failed to parse session file for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Load a session, or start an empty one under `key`
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        Ok(self.load(key).await?.unwrap_or_else(|| Session::new(key)))
    }

    /// Check if a session file exists for a key
    pub fn has_session(&self, key: &str) -> bool {
        self.session_path(key).exists()
    }

    /// List saved session file stems, sorted
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = name.strip_suffix(".json") {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn session_path(&self, key: &str) -> PathBuf {
        // Keys like "overlay:default" become "overlay_default"
        let safe_key: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.sessions_dir.join(format!("{}.json", safe_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let mut session = Session::new("overlay:default");
        session.add_message(Role::User, "hello", Vec::new());
        session.add_message(Role::Assistant, "hi!", vec!["web_search".to_string()]);
        session.last_consolidated = 1;
        store.save(&session).await.unwrap();

        assert!(store.has_session("overlay:default"));
        assert!(dir.path().join("sessions/overlay_default.json").exists());

        let loaded = store.load("overlay:default").await.unwrap().unwrap();
        assert_eq!(loaded.key, "overlay:default");
        assert_eq!(loaded.messages, session.messages);
        assert_eq!(loaded.last_consolidated, 1);
        assert_eq!(loaded.unconsolidated().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        assert!(store.load("nope").await.unwrap().is_none());

        std::fs::write(dir.path().join("sessions/bad.json"), "{ not json").unwrap();
        assert!(store.load("bad").await.unwrap().is_none());

        let fresh = store.get_or_create("bad").await.unwrap();
        assert!(fresh.is_empty());
        assert_eq!(fresh.last_consolidated, 0);
    }

    #[tokio::test]
    async fn test_load_clamps_watermark() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let mut session = Session::new("s");
        session.add_message(Role::User, "one", Vec::new());
        session.last_consolidated = 7;
        store.save(&session).await.unwrap();

        let loaded = store.load("s").await.unwrap().unwrap();
        assert_eq!(loaded.last_consolidated, 1);
        assert!(loaded.unconsolidated().is_empty());
    }

    #[tokio::test]
    async fn test_colliding_keys_do_not_share_a_file() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();

        let mut session = Session::new("a:b");
        session.add_message(Role::User, "kept", Vec::new());
        store.save(&session).await.unwrap();

        assert!(store.load("a_b").await.unwrap().is_none());
        assert!(matches!(
            store.save(&Session::new("a_b")).await,
            Err(KeepsakeError::SessionKey(_))
        ));

        let loaded = store.load("a:b").await.unwrap().unwrap();
        assert_eq!(loaded.key, "a:b");
        assert_eq!(loaded.messages[0].content, "kept");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();
        store.save(&Session::new("b")).await.unwrap();
        store.save(&Session::new("a")).await.unwrap();

        assert_eq!(store.list_sessions().await.unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_message_without_timestamp_deserializes() {
        let msg: SessionMessage =
            serde_json::from_str(r#"{"role": "user", "content": "hey"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert!(msg.timestamp.is_none());
        assert!(msg.tools_used.is_empty());
    }
}
