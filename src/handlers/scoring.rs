//! Scoring variants of the check handler

use std::collections::HashMap;

/// How a completed check is scored
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CheckVariant {
    /// Plain pass/fail
    #[default]
    Strict,
    /// Shorter code scores more
    CodeGolf(GolfScoring),
    /// Each passed category banks points; a test failure keeps what was banked
    Rank(RankScoring),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GolfScoring {
    pub default_max_length: usize,
    /// Per-environment overrides of `default_max_length`
    pub max_lengths: HashMap<String, usize>,
    pub base_points: i64,
}

impl Default for GolfScoring {
    fn default() -> Self {
        Self {
            default_max_length: 1000,
            max_lengths: HashMap::new(),
            base_points: 0,
        }
    }
}

impl GolfScoring {
    pub fn max_length(&self, env_name: &str) -> usize {
        self.max_lengths
            .get(env_name)
            .copied()
            .unwrap_or(self.default_max_length)
    }

    /// Returns `(points, code_length)`; length counts characters
    pub fn score(&self, env_name: &str, code: &str) -> (i64, usize) {
        let length = code.chars().count();
        let saved = self.max_length(env_name).saturating_sub(length);
        (self.base_points + saved as i64, length)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankScoring {
    pub category_points: HashMap<String, i64>,
}

impl Default for RankScoring {
    fn default() -> Self {
        Self {
            category_points: (1..=9).map(|i| (format!("Rank_{:02}", i), 100)).collect(),
        }
    }
}

impl RankScoring {
    pub fn points_for(&self, category: &str) -> i64 {
        self.category_points.get(category).copied().unwrap_or(0)
    }
}
