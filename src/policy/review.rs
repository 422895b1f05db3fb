//! Review checklist and the reviewer-facing summary of a compliance result.

use serde::{Deserialize, Serialize};

use super::risk::RiskLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
    pub required: bool,
}

impl ChecklistItem {
    fn required(id: &str, description: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            description: description.into(),
            required: true,
        }
    }

    fn advisory(id: &str, description: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            description: description.into(),
            required: false,
        }
    }
}

/// Who has to look at the change before it may merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequirements {
    pub min_reviewers: u8,
    pub senior_review: bool,
    pub security_review: bool,
}

impl ReviewRequirements {
    pub fn for_level(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low | RiskLevel::Medium => Self {
                min_reviewers: 1,
                senior_review: false,
                security_review: false,
            },
            RiskLevel::High => Self {
                min_reviewers: 2,
                senior_review: true,
                security_review: false,
            },
            RiskLevel::Critical => Self {
                min_reviewers: 2,
                senior_review: true,
                security_review: true,
            },
        }
    }
}

/// Change characteristics that add checklist entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    pub large_changeset: bool,
    pub migration: bool,
    pub breaking_change: bool,
    pub security_findings: bool,
}

pub fn build_checklist(requirements: &ReviewRequirements, flags: ChangeFlags) -> Vec<ChecklistItem> {
    let mut items = vec![ChecklistItem::required(
        "reviewers",
        format!("At least {} approving review(s)", requirements.min_reviewers),
    )];
    if requirements.senior_review {
        items.push(ChecklistItem::required(
            "senior_review",
            "Senior engineer sign-off",
        ));
    }
    if requirements.security_review || flags.security_findings {
        items.push(ChecklistItem::required(
            "security_review",
            "Security review of flagged findings and risky surfaces",
        ));
    }
    if flags.large_changeset {
        items.push(ChecklistItem::advisory(
            "large_changeset",
            "Large changeset: consider splitting into smaller pull requests",
        ));
    }
    if flags.migration {
        items.push(ChecklistItem::required(
            "migration",
            "Database migration present: verify rollback and data backfill",
        ));
    }
    if flags.breaking_change {
        items.push(ChecklistItem::required(
            "breaking_change",
            "Breaking change present: confirm versioning and downstream consumers",
        ));
    }
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Approved,
    NeedsChanges,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::NeedsChanges => "needs changes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub status: ReviewStatus,
    pub quality_score: u8,
    pub risk_level: RiskLevel,
    /// Markdown body posted to the ticket.
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[ChecklistItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_low_risk_checklist_is_minimal() {
        let requirements = ReviewRequirements::for_level(RiskLevel::Low);
        let items = build_checklist(&requirements, ChangeFlags::default());
        assert_eq!(ids(&items), vec!["reviewers"]);
        assert_eq!(items[0].description, "At least 1 approving review(s)");
    }

    #[test]
    fn test_critical_checklist_with_flags() {
        let requirements = ReviewRequirements::for_level(RiskLevel::Critical);
        let flags = ChangeFlags {
            large_changeset: true,
            migration: true,
            breaking_change: true,
            security_findings: false,
        };
        let items = build_checklist(&requirements, flags);
        assert_eq!(
            ids(&items),
            vec![
                "reviewers",
                "senior_review",
                "security_review",
                "large_changeset",
                "migration",
                "breaking_change"
            ]
        );
        assert!(!items[3].required);
    }

    #[test]
    fn test_security_findings_force_security_review() {
        let requirements = ReviewRequirements::for_level(RiskLevel::Medium);
        let flags = ChangeFlags {
            security_findings: true,
            ..ChangeFlags::default()
        };
        assert!(ids(&build_checklist(&requirements, flags)).contains(&"security_review"));
    }
}
