//! Listing categories and priority tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One listing type crawled for a keyword.
///
/// Ordering follows declaration order, which is also the default crawl order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Jobs,
    Talent,
    Projects,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Jobs, Category::Talent, Category::Projects];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Jobs => "jobs",
            Category::Talent => "talent",
            Category::Projects => "projects",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown category '{0}' (expected jobs, talent or projects)")]
pub struct ParseCategoryError(String);

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jobs" | "job" => Ok(Category::Jobs),
            "talent" => Ok(Category::Talent),
            "projects" | "project" => Ok(Category::Projects),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

/// Priority tier of a Task.
///
/// Serialized as SCREAMING_SNAKE_CASE to match the sink's `recommended_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityTier {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl PriorityTier {
    /// Base selection score of the tier.
    ///
    /// Adjacent tiers are 30 apart, which equals the combined ceiling of the
    /// value bonus (20) and the age bonus (10).
    pub fn base_score(self) -> f64 {
        match self {
            PriorityTier::Critical => 100.0,
            PriorityTier::High => 70.0,
            PriorityTier::Normal => 40.0,
            PriorityTier::Low => 10.0,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorityTier::Critical => "CRITICAL",
            PriorityTier::High => "HIGH",
            PriorityTier::Normal => "NORMAL",
            PriorityTier::Low => "LOW",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown priority tier '{0}' (expected CRITICAL, HIGH, NORMAL or LOW)")]
pub struct ParsePriorityError(String);

impl FromStr for PriorityTier {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(PriorityTier::Critical),
            "HIGH" => Ok(PriorityTier::High),
            "NORMAL" | "MEDIUM" => Ok(PriorityTier::Normal),
            "LOW" => Ok(PriorityTier::Low),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("jobs", Category::Jobs)]
    #[case(" Talent ", Category::Talent)]
    #[case("project", Category::Projects)]
    fn category_parses_loosely(#[case] input: &str, #[case] expected: Category) {
        assert_eq!(input.parse::<Category>().unwrap(), expected);
    }

    #[test]
    fn category_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Category::Jobs).unwrap(), "\"jobs\"");
    }

    #[test]
    fn tier_serializes_as_sink_names() {
        let s = serde_json::to_string(&PriorityTier::Critical).unwrap();
        assert_eq!(s, "\"CRITICAL\"");
        let back: PriorityTier = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(back, PriorityTier::Low);
    }

    #[test]
    fn tier_bases_are_strictly_ordered() {
        assert!(PriorityTier::Critical.base_score() > PriorityTier::High.base_score());
        assert!(PriorityTier::High.base_score() > PriorityTier::Normal.base_score());
        assert!(PriorityTier::Normal.base_score() > PriorityTier::Low.base_score());
    }
}
