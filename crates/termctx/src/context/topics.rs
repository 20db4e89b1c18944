//! Topic store (L1): named summaries of conversation that left the window.
//!
//! Topics are created in three ways: automatically when the window evicts
//! turns, by `compact`/`topic` switches, and by hand. The store holds at most
//! [`TOPIC_CAPACITY`] topics and drops the oldest insertion first. Re-adding
//! an existing name (case-insensitive) replaces it and moves it to the back
//! of the queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::window::{Role, Turn};
use super::{preview, store};
use crate::tokens::{ESTIMATOR_VERSION, estimate};

/// Maximum number of topics retained.
pub const TOPIC_CAPACITY: usize = 10;

const QUESTION_PREVIEW_CHARS: usize = 60;
const ANSWER_PREVIEW_CHARS: usize = 80;
const NAME_WORDS: usize = 3;

/// A named summary of a stretch of conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Topic {
    pub name: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    /// Estimated cost of `summary`.
    pub cost: usize,
}

impl Topic {
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        let cost = estimate(&summary);
        Self {
            name: name.into(),
            summary,
            created_at: Utc::now(),
            cost,
        }
    }

    fn prompt_line(&self) -> String {
        format!(
            "- [{}] {}: {}",
            self.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            self.name,
            self.summary
        )
    }
}

/// Current on-disk shape of `topics.json`.
#[derive(Serialize, Deserialize, Debug, Default)]
struct TopicFile {
    estimator_version: u32,
    topics: Vec<Topic>,
}

/// Accepted on-disk shapes. The bare array predates the version stamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTopics {
    Versioned(TopicFile),
    Legacy(Vec<Topic>),
}

impl Default for StoredTopics {
    fn default() -> Self {
        StoredTopics::Versioned(TopicFile {
            estimator_version: ESTIMATOR_VERSION,
            topics: Vec::new(),
        })
    }
}

impl StoredTopics {
    fn into_parts(self) -> (u32, Vec<Topic>) {
        match self {
            StoredTopics::Versioned(file) => (file.estimator_version, file.topics),
            StoredTopics::Legacy(topics) => (0, topics),
        }
    }
}

/// Bounded FIFO of topics, persisted to `topics.json`.
#[derive(Debug)]
pub struct TopicStore {
    path: Option<PathBuf>,
    topics: VecDeque<Topic>,
    /// Bumped by every mutation.
    version: u64,
    /// Rendered prompt and the version it was rendered at.
    prompt_cache: RefCell<Option<(u64, String)>>,
}

impl TopicStore {
    /// Load topics from `path`. Corrupt data loads as empty. Costs computed
    /// by an older estimator are recomputed and written back.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stored: StoredTopics = store::load_or_default(&path);
        let (saved_version, topics) = stored.into_parts();

        let mut store = Self {
            path: Some(path),
            topics: topics.into(),
            version: 0,
            prompt_cache: RefCell::new(None),
        };

        let mut rewrite = store.enforce_capacity() > 0;
        if saved_version != ESTIMATOR_VERSION {
            let mut changed = 0;
            for topic in store.topics.iter_mut() {
                let cost = estimate(&topic.summary);
                if cost != topic.cost {
                    topic.cost = cost;
                    changed += 1;
                }
            }
            if changed > 0 {
                info!(
                    "Re-estimated {changed} topic cost(s) (estimator v{saved_version} -> v{ESTIMATOR_VERSION})"
                );
                rewrite = true;
            }
        }
        if rewrite {
            store.persist();
        }
        store
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            topics: VecDeque::new(),
            version: 0,
            prompt_cache: RefCell::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Summarise `turns` into a topic and store it. Without a `name` one is
    /// derived from the first user turn. Returns the stored name, or `None`
    /// when `turns` is empty.
    pub fn add_from_turns(&mut self, turns: &[Turn], name: Option<&str>) -> Option<String> {
        if turns.is_empty() {
            return None;
        }
        let summary = summarize_turns(turns);
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => derive_name(turns),
        };
        self.upsert(Topic::new(name.clone(), summary));
        debug!("Stored topic '{name}' from {} turn(s)", turns.len());
        Some(name)
    }

    /// Insert or replace a topic by case-insensitive name.
    pub fn add_manual(&mut self, name: &str, summary: &str) {
        self.upsert(Topic::new(name.trim(), summary));
    }

    /// Remove a topic by case-insensitive name. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(idx) = self.position(name) else {
            return false;
        };
        self.topics.remove(idx);
        self.touch();
        true
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.touch();
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Topic> {
        self.position(name).and_then(|idx| self.topics.get(idx))
    }

    /// Topic names, oldest first.
    pub fn names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// One line per topic, oldest first. Empty string when there are no
    /// topics. Memoised until the next mutation.
    pub fn build_prompt(&self) -> String {
        if let Some((version, prompt)) = self.prompt_cache.borrow().as_ref()
            && *version == self.version
        {
            return prompt.clone();
        }
        let prompt = self
            .topics
            .iter()
            .map(Topic::prompt_line)
            .collect::<Vec<_>>()
            .join("\n");
        *self.prompt_cache.borrow_mut() = Some((self.version, prompt.clone()));
        prompt
    }

    /// Estimated cost of the rendered topics section.
    pub fn estimate_tokens(&self) -> usize {
        estimate(&self.build_prompt())
    }

    fn position(&self, name: &str) -> Option<usize> {
        let needle = name.trim().to_lowercase();
        self.topics
            .iter()
            .position(|t| t.name.to_lowercase() == needle)
    }

    fn upsert(&mut self, topic: Topic) {
        if let Some(idx) = self.position(&topic.name) {
            self.topics.remove(idx);
        }
        self.topics.push_back(topic);
        let dropped = self.enforce_capacity();
        if dropped > 0 {
            debug!("Topic store at capacity, dropped {dropped} oldest");
        }
        self.touch();
    }

    fn enforce_capacity(&mut self) -> usize {
        let mut dropped = 0;
        while self.topics.len() > TOPIC_CAPACITY {
            self.topics.pop_front();
            dropped += 1;
        }
        dropped
    }

    fn touch(&mut self) {
        self.version += 1;
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let file = TopicFile {
            estimator_version: ESTIMATOR_VERSION,
            topics: self.topics.iter().cloned().collect(),
        };
        if let Err(e) = store::write_atomic(path, &file) {
            warn!("Topics not persisted: {e}");
        }
    }
}

/// Render turns as `Q: ... → A: ...` pairs joined by ` | `.
fn summarize_turns(turns: &[Turn]) -> String {
    let mut pairs = Vec::new();
    let mut question: Option<&str> = None;
    for turn in turns {
        match turn.role {
            Role::User => {
                if let Some(q) = question.take() {
                    pairs.push(render_pair(q, ""));
                }
                question = Some(&turn.content);
            }
            Role::Assistant => {
                pairs.push(render_pair(question.take().unwrap_or(""), &turn.content));
            }
        }
    }
    if let Some(q) = question {
        pairs.push(render_pair(q, ""));
    }
    pairs.join(" | ")
}

fn render_pair(question: &str, answer: &str) -> String {
    format!(
        "Q: {} → A: {}",
        preview(question, QUESTION_PREVIEW_CHARS),
        preview(answer, ANSWER_PREVIEW_CHARS)
    )
}

/// First three words longer than two characters from the first user turn,
/// or a timestamped fallback.
fn derive_name(turns: &[Turn]) -> String {
    let words: Vec<&str> = turns
        .iter()
        .find(|t| t.role == Role::User)
        .map(|t| {
            t.content
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .filter(|w| w.chars().count() > 2)
                .take(NAME_WORDS)
                .collect()
        })
        .unwrap_or_default();

    if words.is_empty() {
        timestamped_name("topic")
    } else {
        words.join(" ")
    }
}

/// `<prefix>-YYYYMMDD-HHMMSS` in local time.
pub(crate) fn timestamped_name(prefix: &str) -> String {
    format!("{prefix}-{}", Local::now().format("%Y%m%d-%H%M%S"))
}
