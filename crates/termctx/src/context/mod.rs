//! The four-tier context engine.
//!
//! Every outgoing prompt is compiled from four layers, each with its own
//! retention policy:
//!
//! 0. **[`memory`]** — durable facts (project info, conventions, decisions,
//!    recent items). Persisted to `memory.json`; cleared only explicitly.
//! 1. **[`topics`]** — bounded set of named conversation summaries. FIFO at
//!    capacity. Persisted to `topics.json`.
//! 2. **[`window`]** — the sliding conversation window. Budget-bounded; the
//!    oldest complete turn pairs are evicted and become topics.
//! 3. **[`shell`]** — read-only view of ambient shell state written by the
//!    shell integration.
//!
//! The [`orchestrator`] composes the layers, owns the session dirty flag, and
//! implements the administrative operations (compact, clear, forget, topic
//! switch and recall).

pub mod budget;
pub mod memory;
pub mod orchestrator;
pub mod shell;
pub mod store;
pub mod topics;
pub mod window;

// Re-export commonly used items at the module level.
pub use budget::{ContextBudget, LayerAllotments};
pub use memory::{ExtractedFacts, MemoryCategory, MemoryStore};
pub use orchestrator::{BuiltContext, ContextOrchestrator, ContextStatus};
pub use shell::{ShellState, ShellStateReader};
pub use topics::{Topic, TopicStore};
pub use window::{ConversationWindow, Role, Turn};

/// Single-line preview of `text`: line breaks become spaces, surrounding
/// whitespace is trimmed, and anything past `max_chars` characters is cut
/// and marked with `...`.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let flat = flat.trim();
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        flat.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::preview;

    #[test]
    fn preview_strips_newlines() {
        assert_eq!(preview("line one\nline two\r\n", 80), "line one line two");
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("가나다라마바", 3), "가나다...");
        assert_eq!(preview("abc", 3), "abc");
    }
}
