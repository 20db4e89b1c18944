//! Context budget: how the total cost allowance is split across layers.
//!
//! The budget is static configuration. Only the conversation window enforces
//! its share (by evicting whole turn pairs); the other shares are reported by
//! status as allotments so a user can see which layer is crowding the prompt.

use serde::{Deserialize, Serialize};

/// Default total allowance in estimated tokens.
pub const DEFAULT_TOTAL_TOKENS: usize = 16_000;

/// Split of the total context allowance across the four layers.
///
/// Shares are fractions of [`total`](Self::total) and are expected to sum to
/// roughly 1.0; nothing breaks if they don't, the status view just reports
/// allotments that over- or under-commit the total.
///
/// # Example
///
/// ```
/// use termctx::context::ContextBudget;
///
/// let budget = ContextBudget::default().with_total(10_000);
/// assert_eq!(budget.window_tokens(), 6_500);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    /// Total allowance in estimated tokens.
    pub total: usize,
    /// Share reserved for persistent facts (L0).
    pub memory_share: f64,
    /// Share reserved for topic summaries (L1).
    pub topics_share: f64,
    /// Share enforced by the conversation window (L2).
    pub window_share: f64,
    /// Share reserved for ambient shell state (L3).
    pub shell_share: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            total: DEFAULT_TOTAL_TOKENS,
            memory_share: 0.10,
            topics_share: 0.15,
            window_share: 0.65,
            shell_share: 0.10,
        }
    }
}

impl ContextBudget {
    /// Override the total allowance.
    pub fn with_total(mut self, total: usize) -> Self {
        self.total = total;
        self
    }

    /// Override the window share.
    pub fn with_window_share(mut self, share: f64) -> Self {
        self.window_share = share;
        self
    }

    /// Tokens the conversation window may hold before evicting.
    pub fn window_tokens(&self) -> usize {
        self.share_of(self.window_share)
    }

    /// Per-layer allotments in estimated tokens.
    pub fn allotments(&self) -> LayerAllotments {
        LayerAllotments {
            memory: self.share_of(self.memory_share),
            topics: self.share_of(self.topics_share),
            window: self.window_tokens(),
            shell: self.share_of(self.shell_share),
        }
    }

    fn share_of(&self, share: f64) -> usize {
        (self.total as f64 * share.max(0.0)).floor() as usize
    }
}

/// Allotted tokens per layer, derived from a [`ContextBudget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerAllotments {
    pub memory: usize,
    pub topics: usize,
    pub window: usize,
    pub shell: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shares_cover_the_total() {
        let budget = ContextBudget::default();
        let sum = budget.memory_share + budget.topics_share + budget.window_share + budget.shell_share;
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(budget.window_tokens(), 10_400);
    }

    #[test]
    fn allotments_floor_fractional_tokens() {
        let budget = ContextBudget::default().with_total(101);
        let a = budget.allotments();
        assert_eq!(a.memory, 10);
        assert_eq!(a.topics, 15);
        assert_eq!(a.window, 65);
        assert_eq!(a.shell, 10);
    }

    #[test]
    fn negative_share_is_clamped() {
        let budget = ContextBudget::default().with_window_share(-0.5);
        assert_eq!(budget.window_tokens(), 0);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let budget: ContextBudget = serde_json::from_str(r#"{"total": 2000}"#).unwrap();
        assert_eq!(budget.total, 2000);
        assert!((budget.window_share - 0.65).abs() < 1e-9);
    }
}
