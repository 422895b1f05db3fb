//! Unified configuration for shipwright.
//!
//! Reads `.shipwright/shipwright.toml` from the project directory. Every
//! threshold, weight table, allow-list and retry limit the engine uses comes
//! from here and is injected into the components at construction.
//!
//! Layering: file → environment → CLI.
//!
//! ```toml
//! [workflow]
//! max_retries = 3
//! max_fix_loops = 3
//!
//! [guard]
//! workspace_path = "/workspace"
//! allowed_paths = ["/opt/toolchains"]
//!
//! [sandbox]
//! runtime = "docker"
//! hard_timeout_secs = 600
//!
//! [sandbox.images]
//! rust = "rust:1-slim"
//!
//! [policy.risk_weights]
//! database_migration = 30
//!
//! [[profiles]]
//! language = "node"
//! allowed_commands = ["npm run *", "npm test"]
//!
//! [profiles.check_commands]
//! lint = "npm run lint"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::guard::GuardConfig;
use crate::policy::PolicyConfig;
use crate::profile::RepoProfile;
use crate::sandbox::SandboxConfig;
use crate::workflow::WorkflowConfig;

/// Environment variable overriding `workflow.max_retries`.
pub const ENV_MAX_RETRIES: &str = "SHIPWRIGHT_MAX_RETRIES";
/// Environment variable overriding `sandbox.runtime`.
pub const ENV_SANDBOX_RUNTIME: &str = "SHIPWRIGHT_SANDBOX_RUNTIME";
/// Environment variable overriding `sandbox.hard_timeout_secs`.
pub const ENV_HARD_TIMEOUT: &str = "SHIPWRIGHT_HARD_TIMEOUT";

/// Raw contents of `shipwright.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipwrightToml {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Repository profiles; these take precedence over the built-in ones.
    #[serde(default)]
    pub profiles: Vec<RepoProfile>,
}

impl ShipwrightToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipwright.toml")
    }

    /// Load `shipwright.toml` from `shipwright_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(shipwright_dir: &Path) -> Result<Self> {
        let config_path = shipwright_dir.join("shipwright.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize shipwright.toml")
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.workflow.max_retries = value
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_MAX_RETRIES, value))?;
        }
        if let Some(value) = lookup(ENV_SANDBOX_RUNTIME) {
            self.sandbox.runtime = value;
        }
        if let Some(value) = lookup(ENV_HARD_TIMEOUT) {
            self.sandbox.hard_timeout_secs = value
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_HARD_TIMEOUT, value))?;
        }
        Ok(())
    }

    /// Profile for `language`: configured first, built-in second.
    pub fn profile_for(&self, language: &str) -> Option<RepoProfile> {
        self.profiles
            .iter()
            .find(|p| p.language.eq_ignore_ascii_case(language))
            .cloned()
            .or_else(|| RepoProfile::builtin(language))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let t = &self.policy.risk_thresholds;
        if !(t.low <= t.medium && t.medium <= t.high && t.high <= t.critical) {
            warnings.push(format!(
                "Risk thresholds should be ascending (low {} / medium {} / high {} / critical {})",
                t.low, t.medium, t.high, t.critical
            ));
        }

        for (name, limit) in [
            ("steps", &self.policy.limits.steps),
            ("files", &self.policy.limits.files),
            ("lines_changed", &self.policy.limits.lines_changed),
        ] {
            if limit.soft > limit.hard {
                warnings.push(format!(
                    "Soft limit for {} ({}) exceeds hard limit ({})",
                    name, limit.soft, limit.hard
                ));
            }
        }

        let coverage = &self.policy.limits.test_coverage;
        if coverage.hard > coverage.soft {
            warnings.push(format!(
                "Hard coverage floor ({}) is above soft floor ({})",
                coverage.hard, coverage.soft
            ));
        }

        if self.sandbox.default_timeout_secs > self.sandbox.hard_timeout_secs {
            warnings.push(format!(
                "default_timeout_secs ({}) exceeds hard_timeout_secs ({}); runs will be capped",
                self.sandbox.default_timeout_secs, self.sandbox.hard_timeout_secs
            ));
        }

        if self.sandbox.runtime.trim().is_empty() {
            warnings.push("sandbox.runtime is empty".to_string());
        }

        warnings
    }
}

/// Effective configuration: file contents plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct ShipwrightConfig {
    pub project_dir: PathBuf,
    pub shipwright_dir: PathBuf,
    pub toml: ShipwrightToml,
    pub verbose: bool,
}

impl ShipwrightConfig {
    /// Load configuration for `project_dir`, applying process environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let shipwright_dir = project_dir.join(".shipwright");
        let mut toml = ShipwrightToml::load_or_default(&shipwright_dir)?;
        toml.apply_env_overrides(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            shipwright_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_retries: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(max_retries) = max_retries {
            config.toml.workflow.max_retries = max_retries;
        }
        Ok(config)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.shipwright_dir.join("workflows")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.shipwright_dir.join("logs")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.shipwright_dir.join("archive")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.workflows_dir())
            .context("Failed to create workflows directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.archive_dir())
            .context("Failed to create archive directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let toml = ShipwrightToml::default();
        assert_eq!(toml.workflow.max_retries, 3);
        assert_eq!(toml.guard.max_command_length, 4096);
        assert_eq!(toml.guard.max_arguments, 100);
        assert_eq!(toml.sandbox.hard_timeout_secs, 600);
        assert_eq!(toml.policy.risk_thresholds.low, 20);
        assert_eq!(toml.policy.risk_weights.get("database_migration"), Some(&30));
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let toml = ShipwrightToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.sandbox.runtime, "docker");
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("shipwright.toml"),
            r#"
[workflow]
max_retries = 5

[sandbox.images]
elixir = "elixir:1.17-slim"

[policy.risk_weights]
database_migration = 45
"#,
        )
        .unwrap();

        let toml = ShipwrightToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.workflow.max_retries, 5);
        assert_eq!(toml.workflow.max_fix_loops, 3);
        assert_eq!(
            toml.sandbox.images.get("elixir").map(String::as_str),
            Some("elixir:1.17-slim")
        );
        assert_eq!(toml.policy.risk_weights.get("database_migration"), Some(&45));
        assert_eq!(toml.guard.workspace_path, "/workspace");
    }

    #[test]
    fn test_load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shipwright.toml"), "not valid toml {{{{").unwrap();
        assert!(ShipwrightToml::load_or_default(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_RETRIES, "7"),
            (ENV_SANDBOX_RUNTIME, "podman"),
            (ENV_HARD_TIMEOUT, "120"),
        ]
        .into_iter()
        .collect();

        let mut toml = ShipwrightToml::default();
        toml.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(toml.workflow.max_retries, 7);
        assert_eq!(toml.sandbox.runtime, "podman");
        assert_eq!(toml.sandbox.hard_timeout_secs, 120);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut toml = ShipwrightToml::default();
        let result = toml.apply_env_overrides(|k| {
            (k == ENV_MAX_RETRIES).then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_configured_profile_takes_precedence() {
        let toml = ShipwrightToml::parse(
            r#"
[[profiles]]
language = "rust"
allowed_commands = ["cargo test"]
"#,
        )
        .unwrap();
        let profile = toml.profile_for("Rust").unwrap();
        assert_eq!(profile.allowed_commands, vec!["cargo test"]);
        assert!(toml.profile_for("python").is_some());
        assert!(toml.profile_for("cobol").is_none());
    }

    #[test]
    fn test_validate_flags_inverted_limits() {
        let mut toml = ShipwrightToml::default();
        toml.policy.limits.files.soft = 100;
        toml.policy.limits.files.hard = 10;
        toml.policy.risk_thresholds.medium = 90;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("files")));
        assert!(warnings.iter().any(|w| w.contains("ascending")));
    }

    #[test]
    fn test_round_trip_serialization() {
        let toml = ShipwrightToml::default();
        let text = toml.to_toml_string().unwrap();
        let parsed = ShipwrightToml::parse(&text).unwrap();
        assert_eq!(parsed.guard.max_command_length, 4096);
        assert_eq!(parsed.policy.security_scans, toml.policy.security_scans);
    }

    #[test]
    fn test_config_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShipwrightConfig::with_cli_args(dir.path().to_path_buf(), true, Some(1))
            .unwrap();
        assert!(config.verbose);
        assert_eq!(config.toml.workflow.max_retries, 1);
        config.ensure_directories().unwrap();
        assert!(config.workflows_dir().is_dir());
        assert!(config.archive_dir().is_dir());
    }
}
