//! Conversation window (L2): the sliding, budget-bounded turn buffer.
//!
//! Turns always arrive in user/assistant pairs. When the running cost exceeds
//! the window budget, the oldest complete pairs are popped and handed back to
//! the caller for summarization. The window never talks to the topic store;
//! what happens to evicted turns is the orchestrator's decision.
//!
//! The most recent exchange always survives trimming, even when it alone
//! exceeds the budget.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::preview;
use crate::tokens::estimate;

const USER_PREVIEW_CHARS: usize = 100;
const ASSISTANT_PREVIEW_CHARS: usize = 150;

/// Speaker of a turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message in the conversation window.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Estimated cost of `content`.
    pub cost: usize,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let cost = estimate(&content);
        Self {
            role,
            content,
            created_at: Utc::now(),
            cost,
        }
    }
}

/// Ordered, budget-bounded buffer of conversation turns.
#[derive(Debug)]
pub struct ConversationWindow {
    turns: VecDeque<Turn>,
    total: usize,
    budget: usize,
}

impl ConversationWindow {
    /// Create an empty window that holds at most `budget` estimated tokens
    /// (except for the newest pair, which is always kept).
    pub fn new(budget: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            total: 0,
            budget,
        }
    }

    /// Append a turn, pricing it with the token estimator.
    pub fn add_turn(&mut self, role: Role, content: impl Into<String>) {
        let turn = Turn::new(role, content);
        self.total += turn.cost;
        self.turns.push_back(turn);
    }

    /// Evict the oldest turn pairs while over budget, keeping at least the
    /// newest pair. Returns the evicted turns in conversation order.
    pub fn trim_if_needed(&mut self) -> Vec<Turn> {
        let mut evicted = Vec::new();
        while self.total > self.budget && self.turns.len() > 2 {
            for _ in 0..2 {
                if let Some(turn) = self.turns.pop_front() {
                    self.total = self.total.saturating_sub(turn.cost);
                    evicted.push(turn);
                }
            }
        }
        if !evicted.is_empty() {
            debug!(
                "Window evicted {} turn(s); {} tokens remain of {} budget",
                evicted.len(),
                self.total,
                self.budget
            );
        }
        evicted
    }

    /// Render up to `max_pairs` of the most recent exchanges as a transcript
    /// excerpt, used as a "where we left off" hint when a new remote session
    /// starts.
    pub fn recent_summary(&self, max_pairs: usize) -> String {
        let keep = (max_pairs * 2).min(self.turns.len());
        // Start on a pair boundary so the excerpt never opens mid-exchange.
        let mut start = self.turns.len() - keep;
        if start % 2 == 1 {
            start += 1;
        }

        self.turns
            .iter()
            .skip(start)
            .map(|turn| match turn.role {
                Role::User => format!("User: {}", preview(&turn.content, USER_PREVIEW_CHARS)),
                Role::Assistant => format!(
                    "Assistant: {}",
                    preview(&turn.content, ASSISTANT_PREVIEW_CHARS)
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drop every turn. Returns the removed turns in order.
    pub fn clear(&mut self) -> Vec<Turn> {
        self.total = 0;
        self.turns.drain(..).collect()
    }

    /// Number of complete user/assistant pairs.
    pub fn count(&self) -> usize {
        self.turns.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// All turns, oldest first.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Running estimated cost of every turn in the window.
    pub fn total_tokens(&self) -> usize {
        self.total
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_pair(window: &mut ConversationWindow, user: &str, assistant: &str) {
        window.add_turn(Role::User, user);
        window.add_turn(Role::Assistant, assistant);
    }

    #[test]
    fn count_is_complete_pairs_only() {
        let mut window = ConversationWindow::new(10_000);
        for i in 0..7 {
            window.add_turn(Role::User, format!("turn {i}"));
            // A dangling user turn is not a pair yet.
            assert_eq!(window.count(), i);
            window.add_turn(Role::Assistant, "ok");
        }
        assert_eq!(window.count(), 7);
    }

    #[test]
    fn running_total_tracks_turn_costs() {
        let mut window = ConversationWindow::new(10_000);
        add_pair(&mut window, "aaaa", "가");
        assert_eq!(window.total_tokens(), 3);
        window.clear();
        assert_eq!(window.total_tokens(), 0);
        assert!(window.is_empty());
    }

    #[test]
    fn trim_evicts_oldest_pairs_first() {
        let mut window = ConversationWindow::new(10);
        add_pair(&mut window, "first question", &"a".repeat(40));
        add_pair(&mut window, "second question", &"b".repeat(40));
        add_pair(&mut window, "third question", &"c".repeat(40));

        let evicted = window.trim_if_needed();
        assert_eq!(evicted.len(), 4);
        assert_eq!(evicted[0].content, "first question");
        assert_eq!(evicted[2].content, "second question");
        assert_eq!(window.count(), 1);
        assert_eq!(window.turns().next().unwrap().content, "third question");
    }

    #[test]
    fn newest_pair_survives_even_when_over_budget() {
        let mut window = ConversationWindow::new(1);
        add_pair(&mut window, "q", &"x".repeat(400));
        assert!(window.trim_if_needed().is_empty());
        assert_eq!(window.count(), 1);
        assert!(window.total_tokens() > window.budget());
    }

    #[test]
    fn trim_is_idempotent() {
        let mut window = ConversationWindow::new(30);
        for i in 0..6 {
            add_pair(&mut window, &format!("question {i}"), &"y".repeat(60));
        }
        let first = window.trim_if_needed();
        assert!(!first.is_empty());
        let cost = window.total_tokens();

        assert!(window.trim_if_needed().is_empty());
        assert_eq!(window.total_tokens(), cost);
    }

    #[test]
    fn budget_containment_after_trim() {
        for budget in [0, 5, 17, 40, 200] {
            let mut window = ConversationWindow::new(budget);
            for i in 0..9 {
                add_pair(&mut window, &format!("q{i}"), &"z".repeat(i * 13));
                window.trim_if_needed();
                assert_eq!(window.turns().count() % 2, 0);
                assert!(window.total_tokens() <= budget || window.count() == 1);
            }
        }
    }

    #[test]
    fn recent_summary_renders_latest_pairs_with_previews() {
        let mut window = ConversationWindow::new(10_000);
        add_pair(&mut window, "old question", "old answer");
        add_pair(&mut window, "how do I\nlist files?", &"use ls ".repeat(40));

        let summary = window.recent_summary(1);
        assert!(!summary.contains("old question"));
        assert!(summary.starts_with("User: how do I list files?"));
        let assistant_line = summary.lines().nth(1).unwrap();
        assert!(assistant_line.starts_with("Assistant: use ls"));
        assert!(assistant_line.ends_with("..."));

        let both = window.recent_summary(5);
        assert_eq!(both.lines().count(), 4);
    }

    #[test]
    fn recent_summary_of_empty_window_is_empty() {
        let window = ConversationWindow::new(100);
        assert_eq!(window.recent_summary(3), "");
    }
}
