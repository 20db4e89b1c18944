//! Persistent fact memory (L0).
//!
//! Facts survive restarts in `memory.json` and reach every prompt through
//! [`MemoryStore::build_prompt`]. They enter the store two ways: explicitly
//! (`termctx remember ...`) or through the periodic background extraction
//! pass, which hands over an [`ExtractedFacts`] batch.
//!
//! Explicit facts are filed by keyword:
//!
//! | Contains (case-insensitive) | Category |
//! |-----------------------------|----------|
//! | `convention`, `rule`, `always`, `never` | conventions (deduplicated) |
//! | `decided`, `decision`, `chose` | decisions (deduplicated) |
//! | anything else | recent (FIFO, last 10) |

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store;
use crate::tokens::estimate;

/// Maximum number of entries kept in the `recent` list.
pub const RECENT_CAPACITY: usize = 10;

/// Rendered when the store holds nothing. Callers must treat this as "omit
/// the memory section".
pub const EMPTY_SENTINEL: &str = "(empty)";

const CONVENTION_KEYWORDS: &[&str] = &["convention", "rule", "always", "never"];
const DECISION_KEYWORDS: &[&str] = &["decided", "decision", "chose"];

/// Where a remembered fact was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Convention,
    Decision,
    Recent,
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryCategory::Convention => write!(f, "conventions"),
            MemoryCategory::Decision => write!(f, "decisions"),
            MemoryCategory::Recent => write!(f, "recent"),
        }
    }
}

impl MemoryCategory {
    /// Keyword classification for a free-form fact.
    pub fn classify(fact: &str) -> Self {
        let lower = fact.to_lowercase();
        if CONVENTION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            MemoryCategory::Convention
        } else if DECISION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            MemoryCategory::Decision
        } else {
            MemoryCategory::Recent
        }
    }
}

/// A batch of facts produced by background extraction.
///
/// Every field is optional in the wire form; missing fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExtractedFacts {
    /// Stable project facts as key/value pairs (language, framework, ...).
    pub project: BTreeMap<String, String>,
    /// Coding conventions or rules the user follows.
    pub conventions: Vec<String>,
    /// Decisions that were made.
    pub decisions: Vec<String>,
    /// Notable recent actions or outcomes.
    pub recent: Vec<String>,
}

impl ExtractedFacts {
    pub fn is_empty(&self) -> bool {
        self.project.is_empty()
            && self.conventions.is_empty()
            && self.decisions.is_empty()
            && self.recent.is_empty()
    }
}

/// On-disk shape of `memory.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryData {
    pub project: BTreeMap<String, String>,
    pub conventions: Vec<String>,
    pub decisions: Vec<String>,
    pub recent: VecDeque<String>,
}

impl MemoryData {
    fn is_empty(&self) -> bool {
        self.project.is_empty()
            && self.conventions.is_empty()
            && self.decisions.is_empty()
            && self.recent.is_empty()
    }

    fn push_unique(list: &mut Vec<String>, fact: String) -> bool {
        if list.contains(&fact) {
            false
        } else {
            list.push(fact);
            true
        }
    }

    fn push_recent(&mut self, fact: String) {
        self.recent.push_back(fact);
        self.trim_recent();
    }

    /// Drop the oldest recent items beyond capacity. Returns how many went.
    fn trim_recent(&mut self) -> usize {
        let excess = self.recent.len().saturating_sub(RECENT_CAPACITY);
        self.recent.drain(..excess);
        excess
    }
}

/// Durable fact store backed by `memory.json`.
///
/// Every mutation is written through synchronously. A failed write is logged
/// and otherwise ignored: the in-memory state stays authoritative and a crash
/// before the next successful write loses only that mutation.
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    data: MemoryData,
}

impl MemoryStore {
    /// Load the store from `path`. Missing or corrupt files load empty; a
    /// recent list over capacity keeps its newest items.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut data: MemoryData = store::load_or_default(&path);
        let trimmed = data.trim_recent();
        let memory = Self {
            path: Some(path),
            data,
        };
        if trimmed > 0 {
            debug!("Dropped {trimmed} recent item(s) over capacity");
            memory.persist();
        }
        memory
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: MemoryData::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn data(&self) -> &MemoryData {
        &self.data
    }

    /// File a fact by keyword. Empty input is ignored and reported as
    /// `None`; duplicates of an existing convention or decision are accepted
    /// but not stored twice.
    pub fn remember(&mut self, fact: &str) -> Option<MemoryCategory> {
        let fact = fact.trim();
        if fact.is_empty() {
            return None;
        }
        let category = MemoryCategory::classify(fact);
        let changed = self.insert(category, fact.to_string());
        if changed {
            self.persist();
        }
        debug!("Remembered fact as {category} (new: {changed})");
        Some(category)
    }

    /// Merge an extraction batch: category lists follow the same rules as
    /// [`remember`](Self::remember); `project` keys are last-write-wins.
    pub fn merge_extracted(&mut self, facts: ExtractedFacts) {
        if facts.is_empty() {
            return;
        }
        for (key, value) in facts.project {
            self.data.project.insert(key, value);
        }
        for fact in facts.conventions {
            self.insert(MemoryCategory::Convention, fact);
        }
        for fact in facts.decisions {
            self.insert(MemoryCategory::Decision, fact);
        }
        for fact in facts.recent {
            self.insert(MemoryCategory::Recent, fact);
        }
        self.persist();
    }

    pub fn set_project(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.project.insert(key.into(), value.into());
        self.persist();
    }

    /// Reset to the empty store and persist the reset.
    pub fn clear(&mut self) {
        self.data = MemoryData::default();
        self.persist();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Render the store as labeled sections, or [`EMPTY_SENTINEL`].
    pub fn build_prompt(&self) -> String {
        if self.data.is_empty() {
            return EMPTY_SENTINEL.to_string();
        }

        let mut sections = Vec::new();
        if !self.data.project.is_empty() {
            let lines: Vec<String> = self
                .data
                .project
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect();
            sections.push(format!("Project:\n{}", lines.join("\n")));
        }
        let lists: [(&str, Vec<&String>); 3] = [
            ("Conventions", self.data.conventions.iter().collect()),
            ("Decisions", self.data.decisions.iter().collect()),
            ("Recent", self.data.recent.iter().collect()),
        ];
        for (label, items) in lists {
            if items.is_empty() {
                continue;
            }
            let lines: Vec<String> = items.iter().map(|item| format!("- {item}")).collect();
            sections.push(format!("{label}:\n{}", lines.join("\n")));
        }
        sections.join("\n")
    }

    /// Estimated cost of the rendered memory section (0 when empty).
    pub fn estimate_tokens(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            estimate(&self.build_prompt())
        }
    }

    fn insert(&mut self, category: MemoryCategory, fact: String) -> bool {
        let fact = fact.trim().to_string();
        if fact.is_empty() {
            return false;
        }
        match category {
            MemoryCategory::Convention => MemoryData::push_unique(&mut self.data.conventions, fact),
            MemoryCategory::Decision => MemoryData::push_unique(&mut self.data.decisions, fact),
            MemoryCategory::Recent => {
                self.data.push_recent(fact);
                true
            }
        }
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = store::write_atomic(path, &self.data) {
            warn!("Memory not persisted: {e}");
        }
    }
}
