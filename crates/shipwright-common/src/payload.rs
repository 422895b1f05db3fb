//! Plan and patch payloads exchanged with the AI stage executors.
//!
//! These are the structures the schema validator checks and the policy
//! enforcer scores. Field names are the wire names (snake_case JSON).

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the context stage learned about the checked-out repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoContext {
    pub workspace: PathBuf,
    pub branch: String,
    pub language: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// A single step of an implementation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Implementation plan produced by the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<PlanStep>,
    /// Files the plan intends to touch in addition to those named per step.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub estimated_lines_changed: u32,
    /// Expected test coverage percentage after the change, if known.
    #[serde(default)]
    pub test_coverage: Option<f64>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub breaking_changes: bool,
    #[serde(default)]
    pub requires_migration: bool,
}

impl Plan {
    /// Every file referenced by the plan, deduplicated and sorted.
    pub fn referenced_files(&self) -> Vec<String> {
        let files: BTreeSet<&String> = self
            .files
            .iter()
            .chain(self.steps.iter().flat_map(|s| s.files.iter()))
            .collect();
        files.into_iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    #[default]
    Modified,
    Deleted,
    Renamed,
}

/// One file touched by a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchFile {
    pub path: String,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default)]
    pub change: ChangeKind,
}

/// Severity of a security scan finding, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical findings block approval.
    pub fn is_blocking(&self) -> bool {
        *self >= Self::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub tool: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
}

/// Patch produced by the implementer (or by a fix iteration).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub summary: String,
    pub files: Vec<PatchFile>,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub test_coverage: Option<f64>,
    /// Risk score supplied by the producer, on the same 0-100 scale.
    #[serde(default)]
    pub risk_score: Option<u8>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub breaking_changes: bool,
    #[serde(default)]
    pub breaking_change_description: Option<String>,
    #[serde(default)]
    pub requires_migration: bool,
    #[serde(default)]
    pub security_findings: Vec<SecurityFinding>,
}

impl Patch {
    /// Summed in `u64` so no combination of per-file counts can wrap.
    pub fn total_lines_changed(&self) -> u64 {
        self.files
            .iter()
            .map(|f| u64::from(f.lines_added) + u64::from(f.lines_removed))
            .sum()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, files: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            description: format!("step {}", id),
            files: files.iter().map(|f| f.to_string()).collect(),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_plan_referenced_files_deduplicates() {
        let plan = Plan {
            summary: "add auth".into(),
            steps: vec![step("s1", &["src/auth.rs", "src/lib.rs"]), step("s2", &["src/auth.rs"])],
            files: vec!["tests/auth.rs".into()],
            ..Default::default()
        };
        assert_eq!(
            plan.referenced_files(),
            vec!["src/auth.rs", "src/lib.rs", "tests/auth.rs"]
        );
    }

    #[test]
    fn test_patch_total_lines_changed() {
        let patch = Patch {
            summary: "x".into(),
            files: vec![
                PatchFile {
                    path: "a.rs".into(),
                    lines_added: 10,
                    lines_removed: 3,
                    change: ChangeKind::Modified,
                },
                PatchFile {
                    path: "b.rs".into(),
                    lines_added: 5,
                    lines_removed: 0,
                    change: ChangeKind::Added,
                },
            ],
            ..Default::default()
        };
        assert_eq!(patch.total_lines_changed(), 18);
        assert_eq!(patch.paths(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_patch_total_lines_does_not_wrap() {
        let patch = Patch {
            summary: "x".into(),
            files: vec![
                PatchFile {
                    path: "a.json".into(),
                    lines_added: u32::MAX,
                    lines_removed: 2,
                    change: ChangeKind::Modified,
                },
                PatchFile {
                    path: "b.json".into(),
                    lines_added: u32::MAX,
                    lines_removed: u32::MAX,
                    change: ChangeKind::Modified,
                },
            ],
            ..Default::default()
        };
        assert_eq!(patch.total_lines_changed(), 3 * u64::from(u32::MAX) + 2);
    }

    #[test]
    fn test_severity_ordering_and_blocking() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::High.is_blocking());
        assert!(!Severity::Medium.is_blocking());
    }

    #[test]
    fn test_patch_deserializes_with_defaults() {
        let patch: Patch = serde_json::from_str(
            r#"{"summary": "s", "files": [{"path": "src/main.rs", "lines_added": 4}]}"#,
        )
        .unwrap();
        assert_eq!(patch.files[0].change, ChangeKind::Modified);
        assert!(patch.risk_score.is_none());
        assert!(!patch.requires_migration);
    }
}
