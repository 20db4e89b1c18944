//! Context orchestrator: composes the four layers into one prompt fragment.
//!
//! The orchestrator also owns the session *dirty flag*. The remote backend
//! keeps its own copy of the conversation; any local operation that makes
//! that copy stale (eviction, compact, clear, forget, topic switch, recall)
//! sets the flag. The next [`build`](ContextOrchestrator::build) reports
//! `needs_new_session`, includes a recent-conversation excerpt to make up for
//! the lost remote history, and clears the flag.

use serde::Serialize;
use tracing::{debug, info};

use super::budget::{ContextBudget, LayerAllotments};
use super::memory::{EMPTY_SENTINEL, ExtractedFacts, MemoryCategory, MemoryStore};
use super::shell::ShellStateReader;
use super::topics::{TopicStore, timestamped_name};
use super::window::{ConversationWindow, Role};
use crate::tokens::estimate;

/// Default number of completed turns between extraction passes.
pub const DEFAULT_EXTRACT_EVERY: u64 = 5;

/// Pairs included in the recent-conversation excerpt of a new session.
const RECENT_PAIRS: usize = 3;

const SECTION_SEPARATOR: &str = "\n\n";

/// Output of [`ContextOrchestrator::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltContext {
    /// The composed prompt fragment.
    pub prompt: String,
    /// The remote session must be discarded and a new one started.
    pub needs_new_session: bool,
    /// Name of the topic created from turns evicted during this build.
    pub evicted_topic: Option<String>,
}

/// Cost breakdown reported by the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextStatus {
    pub memory_tokens: usize,
    pub topics_tokens: usize,
    pub window_tokens: usize,
    pub shell_tokens: usize,
    /// Approximate cost of section tags and separators.
    pub framing_tokens: usize,
    pub total_tokens: usize,
    pub budget_total: usize,
    pub allotments: LayerAllotments,
    pub window_pairs: usize,
    pub topic_count: usize,
    pub topic_names: Vec<String>,
    pub turn_count: u64,
    pub dirty: bool,
    /// Filled in by the daemon; the orchestrator knows nothing of sessions.
    pub session_active: bool,
    /// Filled in by the daemon.
    pub query_in_flight: bool,
}

/// Owner of the memory, topic and window layers plus the shell reader.
#[derive(Debug)]
pub struct ContextOrchestrator {
    memory: MemoryStore,
    topics: TopicStore,
    window: ConversationWindow,
    shell: ShellStateReader,
    budget: ContextBudget,
    dirty: bool,
    turn_count: u64,
    extract_every: u64,
}

impl ContextOrchestrator {
    pub fn new(
        memory: MemoryStore,
        topics: TopicStore,
        shell: ShellStateReader,
        budget: ContextBudget,
    ) -> Self {
        let window = ConversationWindow::new(budget.window_tokens());
        Self {
            memory,
            topics,
            window,
            shell,
            budget,
            dirty: false,
            turn_count: 0,
            extract_every: DEFAULT_EXTRACT_EVERY,
        }
    }

    /// Run extraction every `n` completed turns. Zero disables extraction.
    pub fn with_extract_every(mut self, n: u64) -> Self {
        self.extract_every = n;
        self
    }

    /// Compose the outgoing context.
    ///
    /// Trims the window first; evicted turns become a topic and make the
    /// remote session stale. The returned `needs_new_session` is the dirty
    /// flag as it stood after trimming, and the flag is cleared on return.
    pub fn build(&mut self, override_cwd: Option<&str>) -> BuiltContext {
        let evicted = self.window.trim_if_needed();
        let evicted_topic = if evicted.is_empty() {
            None
        } else {
            self.dirty = true;
            self.topics.add_from_turns(&evicted, None)
        };
        if let Some(name) = &evicted_topic {
            info!("Window overflow: {} turn(s) moved to topic '{name}'", evicted.len());
        }

        let needs_new_session = self.dirty;

        let mut sections = Vec::new();
        let memory = self.memory.build_prompt();
        if memory != EMPTY_SENTINEL {
            sections.push(wrap("memory", &memory));
        }
        let topics = self.topics.build_prompt();
        if !topics.is_empty() {
            sections.push(wrap("topics", &topics));
        }
        let shell = self.shell.build_prompt(override_cwd);
        if !shell.is_empty() {
            sections.push(wrap("shell", &shell));
        }
        if needs_new_session && !self.window.is_empty() {
            let recent = self.window.recent_summary(RECENT_PAIRS);
            if !recent.is_empty() {
                sections.push(wrap("recent_conversation", &recent));
            }
        }

        let prompt = sections.join(SECTION_SEPARATOR);
        debug!(
            "Built context: {} section(s), ~{} tokens, new session: {needs_new_session}",
            sections.len(),
            estimate(&prompt)
        );

        self.dirty = false;
        BuiltContext {
            prompt,
            needs_new_session,
            evicted_topic,
        }
    }

    /// Record a completed exchange. Trimming is deferred to the next build.
    pub fn add_turn(&mut self, user: &str, assistant: &str) {
        self.window.add_turn(Role::User, user);
        self.window.add_turn(Role::Assistant, assistant);
        self.turn_count += 1;
    }

    /// Whether the turn just recorded should trigger an extraction pass.
    pub fn should_extract_memory(&self) -> bool {
        self.extract_every > 0 && self.turn_count > 0 && self.turn_count % self.extract_every == 0
    }

    /// Fold the whole window into a `compact-<timestamp>` topic and clear it.
    /// Returns the topic name, or `None` if the window was empty.
    pub fn compact(&mut self) -> Option<String> {
        self.dirty = true;
        let turns = self.window.clear();
        if turns.is_empty() {
            return None;
        }
        let name = self
            .topics
            .add_from_turns(&turns, Some(&timestamped_name("compact")));
        if let Some(name) = &name {
            info!("Compacted {} turn(s) into topic '{name}'", turns.len());
        }
        name
    }

    /// Drop the window without summarising it.
    pub fn clear_window(&mut self) {
        let dropped = self.window.clear();
        self.dirty = true;
        info!("Cleared conversation window ({} turn(s))", dropped.len());
    }

    /// Drop the window, every topic and every remembered fact.
    pub fn clear_all(&mut self) {
        self.window.clear();
        self.topics.clear();
        self.memory.clear();
        self.dirty = true;
        info!("Cleared window, topics and memory");
    }

    /// Save the current window as a topic and start fresh. The topic is
    /// called `name` when given, otherwise a name is derived from the
    /// conversation. Returns the saved topic's name.
    pub fn switch_topic(&mut self, name: Option<&str>) -> Option<String> {
        self.dirty = true;
        let turns = self.window.clear();
        let saved = self.topics.add_from_turns(&turns, name);
        match &saved {
            Some(saved) => info!("Switched topic; saved conversation as '{saved}'"),
            None => info!("Switched topic; window was empty"),
        }
        saved
    }

    /// Look up a topic's summary. Finding one makes the remote session
    /// stale; the summary itself is only returned to the caller, never put
    /// back into the window.
    pub fn recall_topic(&mut self, name: &str) -> Option<String> {
        let summary = self.topics.get(name).map(|t| t.summary.clone())?;
        self.dirty = true;
        debug!("Recalled topic '{name}'");
        Some(summary)
    }

    pub fn remember(&mut self, fact: &str) -> Option<MemoryCategory> {
        self.memory.remember(fact)
    }

    pub fn set_project(&mut self, key: &str, value: &str) {
        self.memory.set_project(key, value);
    }

    pub fn merge_extracted(&mut self, facts: ExtractedFacts) {
        self.memory.merge_extracted(facts);
    }

    /// Per-layer cost breakdown. The framing figure is derived from which
    /// sections are non-empty right now and may differ from the next build.
    pub fn status(&self, override_cwd: Option<&str>) -> ContextStatus {
        let memory_tokens = self.memory.estimate_tokens();
        let topics_tokens = self.topics.estimate_tokens();
        let window_tokens = self.window.total_tokens();
        let shell_tokens = self.shell.estimate_tokens(override_cwd);

        let mut present = Vec::new();
        if !self.memory.is_empty() {
            present.push("memory");
        }
        if !self.topics.is_empty() {
            present.push("topics");
        }
        if shell_tokens > 0 {
            present.push("shell");
        }
        let framing_tokens = framing_cost(&present);

        ContextStatus {
            memory_tokens,
            topics_tokens,
            window_tokens,
            shell_tokens,
            framing_tokens,
            total_tokens: memory_tokens + topics_tokens + window_tokens + shell_tokens + framing_tokens,
            budget_total: self.budget.total,
            allotments: self.budget.allotments(),
            window_pairs: self.window.count(),
            topic_count: self.topics.count(),
            topic_names: self.topics.names(),
            turn_count: self.turn_count,
            dirty: self.dirty,
            session_active: false,
            query_in_flight: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force the next build to start a new session. Used when no remote
    /// session is held, e.g. after a failed query.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn topics(&self) -> &TopicStore {
        &self.topics
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Latest assistant reply, the input for extraction.
    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.window
            .turns()
            .filter(|t| t.role == Role::Assistant)
            .last()
            .map(|t| t.content.as_str())
    }
}

fn wrap(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{body}\n</{tag}>")
}

fn framing_cost(tags: &[&str]) -> usize {
    let tags_cost: usize = tags.iter().map(|tag| estimate(&wrap(tag, ""))).sum();
    let separators = tags.len().saturating_sub(1) * estimate(SECTION_SEPARATOR);
    tags_cost + separators
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn orchestrator(dir: &Path, window_budget: usize) -> ContextOrchestrator {
        let budget = ContextBudget::default()
            .with_total(window_budget * 100)
            .with_window_share(0.01);
        ContextOrchestrator::new(
            MemoryStore::in_memory(),
            TopicStore::in_memory(),
            ShellStateReader::new(dir.join("shell-state.json")),
            budget,
        )
    }

    #[test]
    fn fresh_orchestrator_builds_shell_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        let built = ctx.build(Some("/work"));
        assert_eq!(built.prompt, "<shell>\ncwd: /work\n</shell>");
        assert!(!built.needs_new_session);
        assert!(built.evicted_topic.is_none());
    }

    #[test]
    fn sections_compose_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        ctx.remember("Always use tabs");
        ctx.switch_topic(None);
        ctx.add_turn("what is rust", "a language");
        ctx.topics.add_manual("intro", "hello");

        let prompt = ctx.build(Some("/w")).prompt;
        let memory = prompt.find("<memory>").unwrap();
        let topics = prompt.find("<topics>").unwrap();
        let shell = prompt.find("<shell>").unwrap();
        let recent = prompt.find("<recent_conversation>").unwrap();
        assert!(memory < topics && topics < shell && shell < recent);
        assert!(prompt.contains("</memory>\n\n<topics>"));
    }

    #[test]
    fn dirty_flag_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        ctx.topics.add_manual("known", "summary");

        let ops: Vec<(&str, Box<dyn Fn(&mut ContextOrchestrator)>)> = vec![
            ("compact", Box::new(|c| {
                c.compact();
            })),
            ("clear_window", Box::new(|c| c.clear_window())),
            ("switch_topic", Box::new(|c| {
                c.switch_topic(None);
            })),
            ("recall_topic", Box::new(|c| {
                c.recall_topic("KNOWN");
            })),
            ("clear_all", Box::new(|c| c.clear_all())),
        ];
        for (label, op) in ops {
            ctx.add_turn("q", "a");
            op(&mut ctx);
            assert!(ctx.is_dirty(), "{label} should set dirty");
            assert!(ctx.build(None).needs_new_session, "{label}");
            assert!(!ctx.build(None).needs_new_session, "{label} second build");
        }
    }

    #[test]
    fn recall_of_unknown_topic_leaves_session_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        assert!(ctx.recall_topic("nothing").is_none());
        assert!(!ctx.is_dirty());
    }

    #[test]
    fn recall_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        ctx.topics.add_manual("deploy", "use the blue/green script");
        assert_eq!(
            ctx.recall_topic("Deploy").as_deref(),
            Some("use the blue/green script")
        );
        assert!(ctx.window().is_empty());
    }

    #[test]
    fn eviction_turns_first_pairs_into_one_topic() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 100);
        let long = "word ".repeat(120);
        ctx.add_turn("first question about builds", &long);
        ctx.add_turn("second question about tests", &long);
        ctx.add_turn("third question about deploys", &long);

        let built = ctx.build(None);
        assert!(built.needs_new_session);
        assert_eq!(ctx.window().count(), 1);
        assert_eq!(ctx.topics().count(), 1);

        let name = built.evicted_topic.unwrap();
        assert_eq!(name, "first question about");
        let summary = &ctx.topics().get(&name).unwrap().summary;
        assert_eq!(summary.split(" | ").count(), 2);
        assert!(summary.contains("second question about tests"));
        assert!(!summary.contains("third"));

        assert!(built.prompt.contains("<recent_conversation>"));
        assert!(built.prompt.contains("User: third question about deploys"));
    }

    #[test]
    fn compact_names_topic_and_empties_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        assert!(ctx.compact().is_none());
        assert!(ctx.is_dirty());

        ctx.add_turn("q1", "a1");
        ctx.add_turn("q2", "a2");
        let name = ctx.compact().unwrap();
        assert!(name.starts_with("compact-"));
        assert!(ctx.window().is_empty());
        assert_eq!(
            ctx.topics().get(&name).unwrap().summary,
            "Q: q1 → A: a1 | Q: q2 → A: a2"
        );
    }

    #[test]
    fn switch_topic_uses_given_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        assert!(ctx.switch_topic(Some("nothing yet")).is_none());
        ctx.add_turn("set up the database", "done");
        assert_eq!(ctx.switch_topic(Some("db")).as_deref(), Some("db"));
        assert!(ctx.topics().get("db").is_some());
    }

    #[test]
    fn extraction_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 10_000).with_extract_every(2);
        assert!(!ctx.should_extract_memory());
        ctx.add_turn("a", "b");
        assert!(!ctx.should_extract_memory());
        ctx.add_turn("c", "d");
        assert!(ctx.should_extract_memory());
        assert_eq!(ctx.last_assistant_reply(), Some("d"));

        let disabled = orchestrator(dir.path(), 10).with_extract_every(0);
        assert!(!disabled.should_extract_memory());
    }

    #[test]
    fn status_reports_layers_and_framing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = orchestrator(dir.path(), 1000);
        let bare = ctx.status(Some("/w"));
        assert_eq!(bare.memory_tokens, 0);
        assert_eq!(bare.framing_tokens, estimate("<shell>\n\n</shell>"));

        ctx.remember("Never skip review");
        ctx.add_turn("hello there", "hi");
        let status = ctx.status(Some("/w"));
        assert!(status.memory_tokens > 0);
        assert_eq!(status.window_pairs, 1);
        assert_eq!(status.turn_count, 1);
        assert!(status.framing_tokens > bare.framing_tokens);
        assert_eq!(
            status.total_tokens,
            status.memory_tokens
                + status.topics_tokens
                + status.window_tokens
                + status.shell_tokens
                + status.framing_tokens
        );
        assert_eq!(status.budget_total, 100_000);
    }
}
