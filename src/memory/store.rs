//! Two-layer memory storage: MEMORY.md (long-term facts) + HISTORY.md (log)

use crate::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Header prepended when the long-term document is injected into a prompt
pub const MEMORY_CONTEXT_HEADER: &str = "## Long-term Memory";

/// Two-layer memory rooted at `{workspace}/memory`.
///
/// The long-term document is replaced wholesale on every write. The history
/// log is only ever appended to.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
    memory_file: PathBuf,
    history_file: PathBuf,
}

impl MemoryStore {
    /// Create a store for the given workspace. Nothing touches the disk
    /// until the first write.
    pub fn new(workspace: &Path) -> Self {
        let memory_dir = workspace.join("memory");
        Self {
            memory_file: memory_dir.join("MEMORY.md"),
            history_file: memory_dir.join("HISTORY.md"),
            memory_dir,
        }
    }

    /// Path of the long-term document
    pub fn memory_file(&self) -> &Path {
        &self.memory_file
    }

    /// Path of the history log
    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    /// Current long-term document, or an empty string if none exists yet
    pub async fn read_long_term(&self) -> Result<String> {
        match fs::read_to_string(&self.memory_file).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the long-term document.
    ///
    /// Written to a sibling temp file and renamed into place, so a concurrent
    /// reader sees either the previous or the new document.
    pub async fn write_long_term(&self, content: &str) -> Result<()> {
        fs::create_dir_all(&self.memory_dir).await?;

        let tmp = self.memory_file.with_extension("md.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.memory_file).await?;
        Ok(())
    }

    /// Append one entry to the history log, followed by a blank line
    pub async fn append_history(&self, entry: &str) -> Result<()> {
        fs::create_dir_all(&self.memory_dir).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .await?;
        file.write_all(format!("{}\n\n", entry.trim_end()).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    /// Long-term document wrapped in a section header for prompt injection.
    /// Empty when there is nothing remembered yet.
    pub async fn get_memory_context(&self) -> Result<String> {
        let long_term = self.read_long_term().await?;
        if long_term.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}\n{}", MEMORY_CONTEXT_HEADER, long_term))
    }

    /// All history entries, oldest first
    pub async fn read_history(&self) -> Result<Vec<String>> {
        let content = match fs::read_to_string(&self.history_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(split_entries(&content))
    }

    /// History entries containing `query` (case-insensitive keyword match)
    pub async fn search_history(&self, query: &str) -> Result<Vec<String>> {
        let query_lower = query.to_lowercase();
        Ok(self
            .read_history()
            .await?
            .into_iter()
            .filter(|entry| entry.to_lowercase().contains(&query_lower))
            .collect())
    }
}

/// Split the log on blank lines. Multi-line entries stay intact as long as
/// they contain no blank line of their own.
fn split_entries(content: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                entries.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        entries.push(current.join("\n"));
    }

    entries
}
