//! Memory module for Keepsake
//!
//! Provides the two-layer store, fact extraction from user messages,
//! transcript persistence and LLM-driven consolidation.

mod consolidate;
mod facts;
mod session;
mod store;

pub use consolidate::{
    build_prompt, coerce_text, render_messages, save_memory_tool, select_slice,
    ConsolidationOutcome, ConsolidationPolicy, Consolidator, SliceSelection, SAVE_MEMORY_TOOL,
};
pub use facts::{
    default_rules, normalize_fact, ExtractionRule, FactExtractor, MAX_FACTS_PER_MESSAGE,
    MEMORY_TITLE, RELATIONSHIP_SECTION,
};
pub use session::{Session, SessionMessage, SessionStore};
pub use store::{MemoryStore, MEMORY_CONTEXT_HEADER};
