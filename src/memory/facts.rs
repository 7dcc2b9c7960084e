//! Fact extraction from user messages
//!
//! A fixed, ordered list of pattern rules picks out explicit personal
//! statements ("my name is ...", "remember that ...") and turns them into
//! short declarative facts under the `## Relationship Memory` section of the
//! long-term document.

use super::store::MemoryStore;
use crate::Result;
use chrono::Local;
use regex::Regex;
use tracing::debug;

/// Title written when the long-term document is still empty
pub const MEMORY_TITLE: &str = "# Long-term Memory";

/// Section that extracted facts are appended to
pub const RELATIONSHIP_SECTION: &str = "## Relationship Memory";

/// Upper bound on candidate facts taken from one message
pub const MAX_FACTS_PER_MESSAGE: usize = 5;

/// Characters stripped from both ends of every captured group
const CAPTURE_TRIM: &[char] = &[' ', '\t', '"', '\'', '`'];

/// One extraction rule: a pattern plus the template its captures fill in.
///
/// Templates use positional placeholders (`{0}`, `{1}`) for capture groups.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub pattern: Regex,
    pub template: &'static str,
}

impl ExtractionRule {
    fn new(pattern: &str, template: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("extraction pattern must compile"),
            template,
        }
    }

    /// All candidate facts this rule yields for `text`, in match order
    pub fn apply(&self, text: &str) -> Vec<String> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let groups: Vec<&str> = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str())
                    .filter(|g| !g.is_empty())
                    .map(|g| g.trim_matches(CAPTURE_TRIM))
                    .collect();
                if groups.is_empty() {
                    return None;
                }
                self.render(&groups)
            })
            .collect()
    }

    /// Substitute groups into the template; `None` if a placeholder has no
    /// matching group.
    fn render(&self, groups: &[&str]) -> Option<String> {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let end = start + rest[start..].find('}')?;
            let index: usize = rest[start + 1..end].parse().ok()?;
            out.push_str(groups.get(index)?);
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        Some(out)
    }
}

/// The extraction rules in priority order. Order is observable: candidates
/// beyond [`MAX_FACTS_PER_MESSAGE`] are dropped from the tail.
pub fn default_rules() -> Vec<ExtractionRule> {
    vec![
        ExtractionRule::new(r"(?i)\bmy\s+name\s+is\s+([^.,!\n]{1,60})", "User's name is {0}."),
        ExtractionRule::new(r"(?i)\bi(?:\s+am|'m)\s+from\s+([^.,!\n]{1,80})", "User is from {0}."),
        ExtractionRule::new(r"(?i)\bi\s+prefer\s+([^.,!\n]{1,100})", "User prefers {0}."),
        ExtractionRule::new(
            r"(?i)\bi\s+(?:really\s+)?like\s+([^.,!\n]{1,100})",
            "User likes {0}.",
        ),
        ExtractionRule::new(
            r"(?i)\bi\s+(?:really\s+)?love\s+([^.,!\n]{1,100})",
            "User loves {0}.",
        ),
        ExtractionRule::new(
            r"(?i)\bmy\s+favorite\s+([^.,!\n]{1,40})\s+is\s+([^.,!\n]{1,80})",
            "User's favorite {0} is {1}.",
        ),
        ExtractionRule::new(r"(?i)\bremember\s+that\s+([^\n]{3,180})", "{0}"),
        ExtractionRule::new(r"(?i)\bdon't\s+forget(?:\s+that)?\s+([^\n]{3,180})", "{0}"),
    ]
}

/// Collapse runs of whitespace and trim
pub fn normalize_fact(fact: &str) -> String {
    fact.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Line index of the relationship section header, if present
fn find_section(memory: &str) -> Option<usize> {
    memory
        .lines()
        .position(|line| line.trim_end() == RELATIONSHIP_SECTION)
}

/// Insert `bullet` after the last non-blank line of the relationship
/// section, which ends at the next heading or at the end of the document.
/// Falls back to appending when the section is missing.
fn insert_under_section(memory: &str, bullet: &str) -> String {
    let mut lines: Vec<&str> = memory.lines().collect();
    let Some(start) = find_section(memory) else {
        return format!("{}\n{}", memory, bullet);
    };
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.starts_with('#'))
        .map_or(lines.len(), |offset| start + 1 + offset);
    let insert_at = (start..end)
        .rev()
        .find(|&i| !lines[i].trim().is_empty())
        .map_or(start + 1, |i| i + 1);
    lines.insert(insert_at, bullet);
    lines.join("\n")
}

/// Mines facts from user text and persists them into a [`MemoryStore`]
pub struct FactExtractor {
    store: MemoryStore,
    rules: Vec<ExtractionRule>,
}

impl FactExtractor {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            rules: default_rules(),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Candidate facts for `text`, in rule order, before dedup and before
    /// the per-message cap.
    pub fn extract(&self, text: &str) -> Vec<String> {
        self.rules.iter().flat_map(|rule| rule.apply(text)).collect()
    }

    /// Persist a single fact under the relationship section.
    ///
    /// Returns `Ok(false)` when the fact is empty after normalization or is
    /// already contained (case-insensitively) in the long-term document.
    pub async fn remember_fact(&self, fact: &str) -> Result<bool> {
        let cleaned = normalize_fact(fact);
        if cleaned.is_empty() {
            return Ok(false);
        }

        let mut memory = self.store.read_long_term().await?.trim().to_string();
        if memory.to_lowercase().contains(&cleaned.to_lowercase()) {
            debug!("Fact already remembered: {}", cleaned);
            return Ok(false);
        }

        if memory.is_empty() {
            memory = MEMORY_TITLE.to_string();
        }
        if find_section(&memory).is_none() {
            memory = format!("{}\n\n{}", memory, RELATIONSHIP_SECTION);
        }
        let memory = insert_under_section(&memory, &format!("- {}", cleaned));
        self.store.write_long_term(&format!("{}\n\n", memory)).await?;

        let ts = Local::now().format("%Y-%m-%d %H:%M");
        self.store
            .append_history(&format!("[{}] Learned user fact: {}", ts, cleaned))
            .await?;

        debug!("Remembered fact: {}", cleaned);
        Ok(true)
    }

    /// Extract facts from a user message and persist at most
    /// [`MAX_FACTS_PER_MESSAGE`] of them. Returns how many were new.
    pub async fn capture_from_user_message(&self, text: &str) -> Result<usize> {
        if text.is_empty() {
            return Ok(0);
        }

        let mut saved = 0;
        for fact in self.extract(text).iter().take(MAX_FACTS_PER_MESSAGE) {
            if self.remember_fact(fact).await? {
                saved += 1;
            }
        }
        Ok(saved)
    }
}
