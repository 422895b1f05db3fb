//! Repository profiles: which commands a repository may run and how each
//! required check is executed for its language.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Marker files used to detect a repository's language, checked in order.
const LANGUAGE_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("composer.json", "php"),
    ("go.mod", "go"),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoProfile {
    pub language: String,
    /// Commands the repository may run. Entries match exactly, by prefix,
    /// or as a glob (`npm run *`). Empty means unrestricted.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Required-check name → command that performs it.
    #[serde(default)]
    pub check_commands: BTreeMap<String, String>,
}

impl RepoProfile {
    /// Built-in profile for a known language.
    pub fn builtin(language: &str) -> Option<Self> {
        let (allowed, checks): (&[&str], &[(&str, &str)]) =
            match language.to_ascii_lowercase().as_str() {
                "rust" => (
                    &["cargo *", "rustc", "ls", "cat", "git status", "git diff", "gitleaks"],
                    &[
                        ("lint", "cargo clippy --all-targets"),
                        ("typecheck", "cargo check --all-targets"),
                        ("unit_tests", "cargo test --lib"),
                        ("integration_tests", "cargo test --tests"),
                        ("dependency_audit", "cargo audit"),
                        ("secret_scan", "gitleaks detect --no-git --source /workspace"),
                    ],
                ),
                "node" | "javascript" | "typescript" => (
                    &[
                        "npm run *",
                        "npm test",
                        "npm ci",
                        "npm audit",
                        "npx *",
                        "ls",
                        "cat",
                        "git status",
                        "gitleaks",
                    ],
                    &[
                        ("lint", "npm run lint"),
                        ("typecheck", "npm run typecheck"),
                        ("unit_tests", "npm test"),
                        ("integration_tests", "npm run test:integration"),
                        ("dependency_audit", "npm audit --audit-level=high"),
                        ("secret_scan", "gitleaks detect --no-git --source /workspace"),
                    ],
                ),
                "python" => (
                    &["pytest", "ruff", "mypy", "pip-audit", "python", "ls", "cat", "gitleaks"],
                    &[
                        ("lint", "ruff check ."),
                        ("typecheck", "mypy ."),
                        ("unit_tests", "pytest -q"),
                        ("integration_tests", "pytest -q tests/integration"),
                        ("dependency_audit", "pip-audit"),
                        ("secret_scan", "gitleaks detect --no-git --source /workspace"),
                    ],
                ),
                "php" => (
                    &["composer *", "vendor/bin/*", "php", "ls", "cat", "gitleaks"],
                    &[
                        ("lint", "vendor/bin/phpcs"),
                        ("typecheck", "vendor/bin/phpstan analyse"),
                        ("unit_tests", "composer test"),
                        ("integration_tests", "vendor/bin/phpunit --testsuite integration"),
                        ("dependency_audit", "composer audit"),
                        ("secret_scan", "gitleaks detect --no-git --source /workspace"),
                    ],
                ),
                "go" => (
                    &["go *", "govulncheck", "ls", "cat", "git status", "gitleaks"],
                    &[
                        ("lint", "go vet ./..."),
                        ("typecheck", "go build ./..."),
                        ("unit_tests", "go test ./..."),
                        ("integration_tests", "go test -tags integration ./..."),
                        ("dependency_audit", "govulncheck ./..."),
                        ("secret_scan", "gitleaks detect --no-git --source /workspace"),
                    ],
                ),
                _ => return None,
            };

        Some(Self {
            language: language.to_ascii_lowercase(),
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            check_commands: checks
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    pub fn check_command(&self, check: &str) -> Option<&str> {
        self.check_commands.get(check).map(String::as_str)
    }
}

/// Detect a repository's language from marker files in its root.
/// Returns `"generic"` when nothing matches.
pub fn detect_language(workspace: &Path) -> &'static str {
    LANGUAGE_MARKERS
        .iter()
        .find(|(marker, _)| workspace.join(marker).exists())
        .map(|(_, language)| *language)
        .unwrap_or("generic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_builtin_profiles_cover_mandatory_checks() {
        for language in ["rust", "node", "python", "php", "go"] {
            let profile = RepoProfile::builtin(language).unwrap();
            for check in ["lint", "typecheck", "unit_tests", "integration_tests"] {
                assert!(
                    profile.check_command(check).is_some(),
                    "{} profile is missing {}",
                    language,
                    check
                );
            }
        }
    }

    #[test]
    fn test_builtin_check_commands_pass_their_own_allow_list() {
        let guard = crate::guard::CommandGuard::new(Default::default());
        for language in ["rust", "node", "python", "php", "go"] {
            let profile = RepoProfile::builtin(language).unwrap();
            for (check, command) in &profile.check_commands {
                let validation = guard
                    .validate_command(command, Some(&profile), &[])
                    .unwrap_or_else(|e| panic!("{} {} rejected: {}", language, check, e));
                assert!(
                    validation.safe,
                    "{} {} has violations: {:?}",
                    language,
                    check,
                    validation.violations
                );
            }
        }
    }

    #[test]
    fn test_builtin_aliases_normalize_language() {
        let profile = RepoProfile::builtin("TypeScript").unwrap();
        assert_eq!(profile.language, "typescript");
        assert_eq!(profile.check_command("unit_tests"), Some("npm test"));
        assert!(RepoProfile::builtin("fortran").is_none());
    }

    #[test]
    fn test_detect_language() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_language(dir.path()), "generic");

        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_language(dir.path()), "node");

        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(detect_language(dir.path()), "rust");
    }
}
