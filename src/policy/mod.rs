//! Compliance checks for plans and patches.
//!
//! Limits, path policy, risk scoring, required checks and the review
//! checklist. Outcomes are returned as data: a failed check is a
//! `PolicyCheckResult` with `passed == false`, never an error.

pub mod matcher;
pub mod review;
pub mod risk;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shipwright_common::{Patch, Plan, SecurityFinding, Severity};

pub use matcher::PathMatcher;
pub use review::{
    ChangeFlags, ChecklistItem, ReviewRequirements, ReviewStatus, ReviewSummary, build_checklist,
};
pub use risk::{RiskLevel, RiskThresholds};

/// Upper limit: above `soft` warns, above `hard` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub soft: u32,
    pub hard: u32,
}

impl Limit {
    pub const fn new(soft: u32, hard: u32) -> Self {
        Self { soft, hard }
    }
}

/// Lower limit in percent: below `soft` warns, below `hard` fails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageFloor {
    pub soft: f64,
    pub hard: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyLimits {
    pub steps: Limit,
    pub files: Limit,
    pub lines_changed: Limit,
    pub test_coverage: CoverageFloor,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            steps: Limit::new(10, 20),
            files: Limit::new(20, 50),
            lines_changed: Limit::new(500, 1000),
            test_coverage: CoverageFloor {
                soft: 80.0,
                hard: 60.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub limits: PolicyLimits,
    /// When non-empty, every referenced file must match one of these.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub risk_weights: BTreeMap<String, u32>,
    pub risk_thresholds: RiskThresholds,
    /// Quality checks that must pass (lint, typecheck, unit_tests, integration_tests).
    pub mandatory_checks: BTreeMap<String, bool>,
    /// Security scans that must pass (dependency_audit, secret_scan).
    pub security_scans: BTreeMap<String, bool>,
}

/// Canonical order of quality checks.
pub const QUALITY_CHECKS: &[&str] = &["lint", "typecheck", "unit_tests", "integration_tests"];

impl Default for PolicyConfig {
    fn default() -> Self {
        let enabled = |names: &[&str]| -> BTreeMap<String, bool> {
            names.iter().map(|n| (n.to_string(), true)).collect()
        };
        Self {
            limits: PolicyLimits::default(),
            include: Vec::new(),
            exclude: [".git/**", "**/.env", "**/*.pem", "**/*.key", "**/id_rsa*"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            risk_weights: risk::default_weights(),
            risk_thresholds: RiskThresholds::default(),
            mandatory_checks: enabled(QUALITY_CHECKS),
            security_scans: enabled(&["dependency_audit", "secret_scan"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Quality,
    Security,
}

/// A check that must pass before the workflow may advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCheck {
    pub name: String,
    pub kind: CheckKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheckResult {
    pub passed: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub required_checks: Vec<RequiredCheck>,
    pub security_findings: Vec<SecurityFinding>,
    pub review: ReviewRequirements,
    pub review_checklist: Vec<ChecklistItem>,
    /// False when retrying cannot help (critical security finding).
    pub retryable: bool,
}

impl PolicyCheckResult {
    pub fn has_blocking_finding(&self) -> bool {
        self.security_findings
            .iter()
            .any(|f| f.severity.is_blocking())
    }

    pub fn to_review_summary(&self) -> ReviewSummary {
        let status = if self.violations.is_empty() && !self.has_blocking_finding() {
            ReviewStatus::Approved
        } else {
            ReviewStatus::NeedsChanges
        };
        let quality_score = 100u8.saturating_sub(self.risk_score);

        let mut body = format!(
            "## Policy review: {}\n\n**Risk:** {} ({}/100) | **Quality score:** {}/100\n",
            status.as_str(),
            self.risk_level,
            self.risk_score,
            quality_score
        );
        push_section(&mut body, "Violations", &self.violations);
        push_section(&mut body, "Warnings", &self.warnings);
        let findings: Vec<String> = self
            .security_findings
            .iter()
            .map(|f| format!("[{}] {}: {}", f.severity, f.tool, f.message))
            .collect();
        push_section(&mut body, "Security findings", &findings);
        if !self.review_checklist.is_empty() {
            body.push_str("\n### Review checklist\n");
            for item in &self.review_checklist {
                let suffix = if item.required { "" } else { " (advisory)" };
                body.push_str(&format!("- [ ] {}{}\n", item.description, suffix));
            }
        }

        ReviewSummary {
            status,
            quality_score,
            risk_level: self.risk_level,
            body,
        }
    }
}

fn push_section(body: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    body.push_str(&format!("\n### {}\n", title));
    for line in lines {
        body.push_str(&format!("- {}\n", line));
    }
}

/// Evaluates plans and patches against an injected `PolicyConfig`.
pub struct PolicyEnforcer {
    config: PolicyConfig,
    paths: PathMatcher,
}

/// Inputs shared by plan and patch evaluation.
struct Subject<'a> {
    kind: &'a str,
    files: Vec<String>,
    lines_changed: u64,
    test_coverage: Option<f64>,
    breaking_change: bool,
    migration: bool,
    declared_factors: &'a [String],
    findings: &'a [SecurityFinding],
    external_score: Option<u8>,
}

impl PolicyEnforcer {
    pub fn new(config: PolicyConfig) -> Result<Self, regex::Error> {
        let paths = PathMatcher::new(&config.include, &config.exclude)?;
        Ok(Self { config, paths })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn check_plan_compliance(&self, plan: &Plan) -> PolicyCheckResult {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        check_limit(
            "Plan step count",
            plan.steps.len() as u64,
            &self.config.limits.steps,
            &mut violations,
            &mut warnings,
        );

        let result = self.evaluate(
            Subject {
                kind: "Plan",
                files: plan.referenced_files(),
                lines_changed: u64::from(plan.estimated_lines_changed),
                test_coverage: plan.test_coverage,
                breaking_change: plan.breaking_changes,
                migration: plan.requires_migration,
                declared_factors: &plan.risk_factors,
                findings: &[],
                external_score: None,
            },
            violations,
            warnings,
        );
        tracing::info!(
            passed = result.passed,
            risk_score = result.risk_score,
            risk_level = %result.risk_level,
            "Plan compliance checked"
        );
        result
    }

    pub fn check_patch_compliance(&self, patch: &Patch) -> PolicyCheckResult {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for finding in &patch.security_findings {
            let location = finding
                .file
                .as_deref()
                .map(|f| format!(" in {}", f))
                .unwrap_or_default();
            let line = format!(
                "Security finding ({}) from {}{}: {}",
                finding.severity, finding.tool, location, finding.message
            );
            if finding.severity.is_blocking() {
                violations.push(line);
            } else {
                warnings.push(line);
            }
        }

        let result = self.evaluate(
            Subject {
                kind: "Patch",
                files: patch.paths(),
                lines_changed: patch.total_lines_changed(),
                test_coverage: patch.test_coverage,
                breaking_change: patch.breaking_changes,
                migration: patch.requires_migration,
                declared_factors: &patch.risk_factors,
                findings: &patch.security_findings,
                external_score: patch.risk_score,
            },
            violations,
            warnings,
        );
        tracing::info!(
            passed = result.passed,
            risk_score = result.risk_score,
            risk_level = %result.risk_level,
            findings = result.security_findings.len(),
            "Patch compliance checked"
        );
        result
    }

    fn evaluate(
        &self,
        subject: Subject<'_>,
        mut violations: Vec<String>,
        mut warnings: Vec<String>,
    ) -> PolicyCheckResult {
        let limits = &self.config.limits;

        check_limit(
            &format!("{} file count", subject.kind),
            subject.files.len() as u64,
            &limits.files,
            &mut violations,
            &mut warnings,
        );
        check_limit(
            &format!("{} lines changed", subject.kind),
            subject.lines_changed,
            &limits.lines_changed,
            &mut violations,
            &mut warnings,
        );

        let mut insufficient_coverage = false;
        if let Some(coverage) = subject.test_coverage {
            let floor = &limits.test_coverage;
            if coverage < floor.hard {
                violations.push(format!(
                    "Test coverage {:.1}% is below the required minimum of {:.1}%",
                    coverage, floor.hard
                ));
                insufficient_coverage = true;
            } else if coverage < floor.soft {
                warnings.push(format!(
                    "Test coverage {:.1}% is below the recommended {:.1}%",
                    coverage, floor.soft
                ));
                insufficient_coverage = true;
            }
        }

        violations.extend(
            subject
                .files
                .iter()
                .filter_map(|path| self.paths.rejection(path)),
        );

        let large_changeset = subject.lines_changed > u64::from(limits.lines_changed.soft)
            || subject.files.len() as u64 > u64::from(limits.files.soft);
        let blocking_finding = subject.findings.iter().any(|f| f.severity.is_blocking());

        let mut factors: Vec<&str> = subject
            .declared_factors
            .iter()
            .map(String::as_str)
            .collect();
        for (present, name) in [
            (subject.migration, risk::DATABASE_MIGRATION),
            (subject.breaking_change, risk::API_BREAKING_CHANGE),
            (blocking_finding, risk::SECURITY_VULNERABILITY),
            (large_changeset, risk::LARGE_CHANGESET),
            (insufficient_coverage, risk::INSUFFICIENT_TEST_COVERAGE),
        ] {
            if present {
                factors.push(name);
            }
        }

        let assessment = risk::assess(
            factors,
            &self.config.risk_weights,
            &self.config.risk_thresholds,
            subject.external_score,
        );
        for name in &assessment.unknown {
            warnings.push(format!("Unknown risk factor '{}' was not scored", name));
        }
        if subject.migration {
            warnings.push(format!("{} requires a database migration", subject.kind));
        }
        if subject.breaking_change {
            warnings.push(format!("{} introduces a breaking change", subject.kind));
        }

        let mut review = ReviewRequirements::for_level(assessment.level);
        if self
            .config
            .risk_thresholds
            .requires_security_review(assessment.score)
        {
            review.security_review = true;
        }
        let review_checklist = build_checklist(
            &review,
            ChangeFlags {
                large_changeset,
                migration: subject.migration,
                breaking_change: subject.breaking_change,
                security_findings: !subject.findings.is_empty(),
            },
        );

        let retryable = !subject
            .findings
            .iter()
            .any(|f| f.severity == Severity::Critical);

        PolicyCheckResult {
            passed: violations.is_empty(),
            violations,
            warnings,
            risk_score: assessment.score,
            risk_level: assessment.level,
            risk_factors: assessment.factors,
            required_checks: self.required_checks(),
            security_findings: subject.findings.to_vec(),
            review,
            review_checklist,
            retryable,
        }
    }

    /// Enabled quality checks in canonical order, then enabled security scans.
    pub fn required_checks(&self) -> Vec<RequiredCheck> {
        let quality = QUALITY_CHECKS
            .iter()
            .filter(|name| self.config.mandatory_checks.get(**name) == Some(&true))
            .map(|name| name.to_string());
        // configured extras after the canonical ones
        let extra = self
            .config
            .mandatory_checks
            .iter()
            .filter(|(name, enabled)| **enabled && !QUALITY_CHECKS.contains(&name.as_str()))
            .map(|(name, _)| name.clone());
        let security = self
            .config
            .security_scans
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| RequiredCheck {
                name: name.clone(),
                kind: CheckKind::Security,
            });

        quality
            .chain(extra)
            .map(|name| RequiredCheck {
                name,
                kind: CheckKind::Quality,
            })
            .chain(security)
            .collect()
    }
}

fn check_limit(
    label: &str,
    value: u64,
    limit: &Limit,
    violations: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if value > u64::from(limit.hard) {
        violations.push(format!(
            "{} {} exceeds the hard limit of {}",
            label, value, limit.hard
        ));
    } else if value > u64::from(limit.soft) {
        warnings.push(format!(
            "{} {} exceeds the soft limit of {}",
            label, value, limit.soft
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::{PatchFile, PlanStep};

    fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::new(PolicyConfig::default()).unwrap()
    }

    fn step(id: &str, files: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            description: format!("do {}", id),
            files: files.iter().map(|f| f.to_string()).collect(),
            depends_on: Vec::new(),
        }
    }

    fn file(path: &str, added: u32, removed: u32) -> PatchFile {
        PatchFile {
            path: path.to_string(),
            lines_added: added,
            lines_removed: removed,
            change: Default::default(),
        }
    }

    fn small_plan() -> Plan {
        Plan {
            summary: "Add rate limiting".into(),
            steps: vec![
                step("s1", &["src/limit.rs", "src/lib.rs"]),
                step("s2", &["tests/limit.rs"]),
            ],
            estimated_lines_changed: 120,
            test_coverage: Some(85.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_small_plan_without_risk_factors_is_low_risk() {
        let result = enforcer().check_plan_compliance(&small_plan());
        assert!(result.passed);
        assert!(result.violations.is_empty());
        assert!(result.warnings.is_empty());
        assert_eq!(result.risk_score, 0);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert!(result.retryable);
        assert_eq!(result.review.min_reviewers, 1);
    }

    #[test]
    fn test_breaking_change_with_migration_is_high_risk() {
        let patch = Patch {
            summary: "Rename users table".into(),
            files: vec![file("src/db.rs", 40, 10), file("migrations/002.sql", 12, 0)],
            test_coverage: Some(90.0),
            breaking_changes: true,
            requires_migration: true,
            ..Default::default()
        };
        let result = enforcer().check_patch_compliance(&patch);

        assert!(result.risk_score >= 55);
        assert!(result.risk_level >= RiskLevel::High);
        let ids: Vec<&str> = result.review_checklist.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"breaking_change"));
        assert!(ids.contains(&"migration"));
        assert!(result.warnings.iter().any(|w| w.contains("breaking change")));
        assert!(result.warnings.iter().any(|w| w.contains("database migration")));
        assert!(result.passed);
    }

    #[test]
    fn test_soft_and_hard_limits() {
        let mut plan = small_plan();
        plan.estimated_lines_changed = 700;
        let soft = enforcer().check_plan_compliance(&plan);
        assert!(soft.passed);
        assert!(soft.warnings.iter().any(|w| w.contains("soft limit of 500")));
        assert!(soft.risk_factors.contains(&risk::LARGE_CHANGESET.to_string()));

        plan.estimated_lines_changed = 5000;
        let hard = enforcer().check_plan_compliance(&plan);
        assert!(!hard.passed);
        assert!(hard.violations.iter().any(|v| v.contains("hard limit of 1000")));
    }

    #[test]
    fn test_line_counts_past_u32_fail_the_hard_limit() {
        let patch = Patch {
            summary: "Regenerate fixtures".into(),
            files: vec![file("fixtures/big.json", u32::MAX, 2)],
            ..Default::default()
        };
        let result = enforcer().check_patch_compliance(&patch);
        assert!(!result.passed);
        assert!(
            result
                .violations
                .iter()
                .any(|v| v.starts_with("Patch lines changed 4294967297 exceeds the hard limit"))
        );
    }

    #[test]
    fn test_too_many_steps() {
        let mut plan = small_plan();
        plan.steps = (0..25).map(|i| step(&format!("s{}", i), &[])).collect();
        let result = enforcer().check_plan_compliance(&plan);
        assert!(!result.passed);
        assert!(result.violations[0].starts_with("Plan step count 25"));
    }

    #[test]
    fn test_coverage_floor() {
        let mut plan = small_plan();
        plan.test_coverage = Some(70.0);
        let warned = enforcer().check_plan_compliance(&plan);
        assert!(warned.passed);
        assert_eq!(warned.risk_score, 20);

        plan.test_coverage = Some(40.0);
        let failed = enforcer().check_plan_compliance(&plan);
        assert!(!failed.passed);
        assert!(failed.violations[0].contains("below the required minimum"));
    }

    #[test]
    fn test_excluded_and_non_included_paths() {
        let config = PolicyConfig {
            include: vec!["src/**".into(), "tests/**".into()],
            ..PolicyConfig::default()
        };
        let enforcer = PolicyEnforcer::new(config).unwrap();
        let patch = Patch {
            summary: "x".into(),
            files: vec![
                file("src/ok.rs", 1, 0),
                file("src/secrets/.env", 1, 0),
                file("Dockerfile", 1, 0),
            ],
            ..Default::default()
        };
        let result = enforcer.check_patch_compliance(&patch);
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 2);
    }

    #[test]
    fn test_security_findings() {
        let patch = Patch {
            summary: "x".into(),
            files: vec![file("src/a.rs", 1, 1)],
            security_findings: vec![
                SecurityFinding {
                    tool: "semgrep".into(),
                    severity: Severity::Medium,
                    message: "weak hash".into(),
                    file: Some("src/a.rs".into()),
                },
                SecurityFinding {
                    tool: "gitleaks".into(),
                    severity: Severity::Critical,
                    message: "AWS key committed".into(),
                    file: None,
                },
            ],
            ..Default::default()
        };
        let result = enforcer().check_patch_compliance(&patch);
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("in src/a.rs"));
        assert!(!result.retryable);
        assert!(result.review.security_review || result.review_checklist.iter().any(|i| i.id == "security_review"));
        assert_eq!(result.to_review_summary().status, ReviewStatus::NeedsChanges);
    }

    #[test]
    fn test_unknown_declared_factor_warns() {
        let mut plan = small_plan();
        plan.risk_factors = vec!["vendor_lock_in".into()];
        let result = enforcer().check_plan_compliance(&plan);
        assert_eq!(result.risk_score, 0);
        assert!(result.warnings[0].contains("vendor_lock_in"));
    }

    #[test]
    fn test_required_checks() {
        let mut config = PolicyConfig::default();
        config.mandatory_checks.insert("typecheck".into(), false);
        config.mandatory_checks.insert("e2e".into(), true);
        let checks = PolicyEnforcer::new(config).unwrap().required_checks();
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "lint",
                "unit_tests",
                "integration_tests",
                "e2e",
                "dependency_audit",
                "secret_scan"
            ]
        );
        assert_eq!(checks[4].kind, CheckKind::Security);
    }

    #[test]
    fn test_review_summary() {
        let approved = enforcer().check_plan_compliance(&small_plan()).to_review_summary();
        assert_eq!(approved.status, ReviewStatus::Approved);
        assert_eq!(approved.quality_score, 100);
        assert!(approved.body.starts_with("## Policy review: approved"));

        let mut plan = small_plan();
        plan.requires_migration = true;
        plan.test_coverage = Some(10.0);
        let summary = enforcer().check_plan_compliance(&plan).to_review_summary();
        assert_eq!(summary.status, ReviewStatus::NeedsChanges);
        assert_eq!(summary.quality_score, 50);
        assert!(summary.body.contains("### Violations"));
        assert!(summary.body.contains("### Review checklist"));
    }
}
