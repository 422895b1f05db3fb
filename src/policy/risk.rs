//! Risk scoring over a named-factor weight table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DATABASE_MIGRATION: &str = "database_migration";
pub const API_BREAKING_CHANGE: &str = "api_breaking_change";
pub const SECURITY_VULNERABILITY: &str = "security_vulnerability";
pub const LARGE_CHANGESET: &str = "large_changeset";
pub const INSUFFICIENT_TEST_COVERAGE: &str = "insufficient_test_coverage";

pub fn default_weights() -> BTreeMap<String, u32> {
    [
        (DATABASE_MIGRATION, 30),
        (API_BREAKING_CHANGE, 25),
        (SECURITY_VULNERABILITY, 40),
        (LARGE_CHANGESET, 10),
        (INSUFFICIENT_TEST_COVERAGE, 20),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk buckets. `low`, `medium` and `high` are inclusive upper bounds:
/// with the defaults 0..=20 is low, 21..=40 medium, 41..=60 high and
/// anything above 60 critical.
///
/// `critical` does not move the level. It is the score at or above which a
/// security reviewer is mandatory (`requires_security_review`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub low: u8,
    pub medium: u8,
    pub high: u8,
    pub critical: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 20,
            medium: 40,
            high: 60,
            critical: 80,
        }
    }
}

impl RiskThresholds {
    pub fn level(&self, score: u8) -> RiskLevel {
        if score <= self.low {
            RiskLevel::Low
        } else if score <= self.medium {
            RiskLevel::Medium
        } else if score <= self.high {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    /// Scores at or above `critical` always need a security reviewer.
    pub fn requires_security_review(&self, score: u8) -> bool {
        score >= self.critical
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub score: u8,
    pub level: RiskLevel,
    /// Deduplicated factor names, sorted.
    pub factors: Vec<String>,
    /// Factor names with no configured weight.
    pub unknown: Vec<String>,
}

/// Sum the weights of the distinct `factors`, clamped to 0..=100.
pub fn score<'a, I>(factors: I, weights: &BTreeMap<String, u32>) -> (u8, Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = &'a str>,
{
    let distinct: BTreeSet<&str> = factors.into_iter().collect();
    let mut total: u32 = 0;
    let mut unknown = Vec::new();
    for factor in &distinct {
        match weights.get(*factor) {
            Some(weight) => total = total.saturating_add(*weight),
            None => unknown.push(factor.to_string()),
        }
    }
    (
        total.min(100) as u8,
        distinct.into_iter().map(str::to_string).collect(),
        unknown,
    )
}

pub fn assess<'a, I>(
    factors: I,
    weights: &BTreeMap<String, u32>,
    thresholds: &RiskThresholds,
    external: Option<u8>,
) -> RiskAssessment
where
    I: IntoIterator<Item = &'a str>,
{
    let (derived, factors, unknown) = score(factors, weights);
    let score = external.map_or(derived, |e| e.min(100).max(derived));
    RiskAssessment {
        score,
        level: thresholds.level(score),
        factors,
        unknown,
    }
}
