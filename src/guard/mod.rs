//! Command guard: validates commands and paths before anything is executed.
//!
//! Validation runs in a fixed order and stops at the first fatal finding:
//!
//! 1. length cap (fatal, `CommandBlocked`)
//! 2. deny-list match on the normalized command (fatal, `CommandBlocked`)
//! 3. suspicious-pattern regexes (reported in `violations`)
//! 4. repository allowed-command list (reported)
//! 5. path extraction and allow-list check (fatal, `PathViolation`)
//! 6. argument count (reported)
//!
//! The guard also owns output sanitization and the per-ticket rate limiter.

pub mod paths;
pub mod rate_limit;
pub mod sanitize;

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::GuardError;
use crate::profile::RepoProfile;

pub use paths::PathPolicy;
pub use rate_limit::RateLimiter;
pub use sanitize::{REDACTION_MARKER, SanitizedOutput, TRUNCATION_MARKER, sanitize_output};

/// Substrings that block a command outright. Matched against the
/// lower-cased, whitespace-collapsed command padded with one space on each
/// side, so entries with a leading space only match whole tokens.
pub const DENY_LIST: &[&str] = &[
    // destructive filesystem operations
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "rm -rf .",
    "rm -fr /",
    "rm -fr ~",
    "rm --no-preserve-root",
    " mkfs",
    "dd if=",
    " shred ",
    " wipefs ",
    "chmod -r 777 /",
    "chmod 777 /",
    "chown -r root",
    "> /dev/sd",
    // privilege escalation
    " sudo ",
    " su ",
    " doas ",
    " chroot ",
    " visudo",
    " useradd ",
    " usermod ",
    " passwd ",
    " setcap ",
    // fork bomb
    ":(){ :|:& };:",
    ":(){:|:&};:",
    // shell chaining, redirection, substitution
    "&&",
    "||",
    ";",
    "`",
    "$(",
    " & ",
    ">>",
    "> /",
    "< /",
    "<(",
    ">(",
    " eval ",
    " exec ",
    // network exfiltration
    " curl ",
    " wget ",
    " nc ",
    " ncat ",
    " netcat ",
    " socat ",
    " ssh ",
    " scp ",
    " sftp ",
    " ftp ",
    " telnet ",
    " rsync ",
    "/dev/tcp/",
    "/dev/udp/",
    // system control
    " shutdown",
    " reboot",
    " poweroff",
    " halt ",
    " init 0",
    " kill -9 -1",
];

/// Patterns that are reported but do not block on their own.
static SUSPICIOUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\.\./", "Directory traversal pattern detected"),
        (
            r"(?i)/etc/(passwd|shadow|sudoers|group)|\.ssh/|\.aws/credentials|\bid_rsa\b|(^|[\s/])\.env(\s|$)",
            "Sensitive file access detected",
        ),
        (r"\$[({]", "Command substitution detected"),
        (r"\|\s*(sh|bash|zsh|dash|ksh)\b", "Piping to a shell detected"),
        (r"2>", "Stderr redirection detected"),
    ]
    .into_iter()
    .map(|(pattern, message)| {
        (
            Regex::new(pattern).expect("suspicious pattern regex is valid"),
            message,
        )
    })
    .collect()
});

/// Tools whose first argument is part of the command identity
/// (`cargo test`, `composer test`, `git status`).
const SUBCOMMAND_TOOLS: &[&str] = &[
    "npm", "pnpm", "yarn", "bun", "npx", "composer", "cargo", "go", "make", "git", "poetry",
    "pipenv", "bundle", "mix", "dotnet", "gradle", "mvn", "deno",
];

/// Package runners whose `run <script>` form counts as one unit (`npm run lint`).
const SCRIPT_RUNNERS: &[&str] = &["npm", "pnpm", "yarn", "bun"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    #[serde(default = "default_max_arguments")]
    pub max_arguments: usize,
    /// Workspace path as seen by the executed command.
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    /// Directories allowed in addition to the fixed allow-list and the workspace.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    #[serde(default = "default_rate_limit_decay_secs")]
    pub rate_limit_decay_secs: u64,
}

fn default_max_command_length() -> usize {
    4096
}

fn default_max_arguments() -> usize {
    100
}

fn default_workspace_path() -> String {
    "/workspace".to_string()
}

fn default_rate_limit_attempts() -> u32 {
    10
}

fn default_rate_limit_decay_secs() -> u64 {
    60
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_command_length: default_max_command_length(),
            max_arguments: default_max_arguments(),
            workspace_path: default_workspace_path(),
            allowed_paths: Vec::new(),
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_decay_secs: default_rate_limit_decay_secs(),
        }
    }
}

/// Outcome of a successful (non-fatal) validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandValidation {
    pub original: String,
    pub normalized: String,
    pub violations: Vec<String>,
    pub safe: bool,
}

pub struct CommandGuard {
    config: GuardConfig,
    rate_limiter: RateLimiter,
}

impl CommandGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            rate_limiter: RateLimiter::new(),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Validate `command`. Fatal findings are returned as errors; everything
    /// else is collected in `CommandValidation::violations`.
    pub fn validate_command(
        &self,
        command: &str,
        profile: Option<&RepoProfile>,
        allowed_paths: &[String],
    ) -> Result<CommandValidation, GuardError> {
        if command.len() > self.config.max_command_length {
            return Err(GuardError::blocked(format!(
                "command length {} exceeds maximum of {}",
                command.len(),
                self.config.max_command_length
            )));
        }

        let normalized = normalize_command(command);
        let padded = format!(" {} ", normalized);
        if let Some(entry) = DENY_LIST.iter().find(|entry| padded.contains(*entry)) {
            return Err(GuardError::blocked(format!(
                "matches deny-listed pattern '{}'",
                entry.trim()
            )));
        }

        let mut violations: Vec<String> = SUSPICIOUS_PATTERNS
            .iter()
            .filter(|(regex, _)| regex.is_match(command))
            .map(|(_, message)| message.to_string())
            .collect();

        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();

        if let Some(profile) = profile
            && !profile.allowed_commands.is_empty()
        {
            let base = base_command(&tokens);
            if !is_command_allowed(&base, &profile.allowed_commands) {
                violations.push(format!(
                    "Command '{}' is not allowed for {} repositories",
                    base, profile.language
                ));
            }
        }

        let policy = PathPolicy::new(&self.config.workspace_path, &self.config.allowed_paths)
            .with_extra(allowed_paths);
        policy.check_command(command)?;

        let argument_count = tokens.len().saturating_sub(1);
        if argument_count > self.config.max_arguments {
            violations.push(format!(
                "Too many arguments: {} (maximum {})",
                argument_count, self.config.max_arguments
            ));
        }

        if !violations.is_empty() {
            tracing::debug!(command = %normalized, ?violations, "command has guard violations");
        }

        Ok(CommandValidation {
            original: command.to_string(),
            safe: violations.is_empty(),
            normalized,
            violations,
        })
    }

    pub fn sanitize_output(&self, text: &str, max_size: usize) -> SanitizedOutput {
        sanitize_output(text, max_size)
    }

    /// Record an attempt for `key`. Returns `true` when the attempt is blocked.
    pub fn rate_limit(&self, key: &str, max_attempts: u32, decay_seconds: u64) -> bool {
        self.rate_limiter
            .hit(key, max_attempts, Duration::from_secs(decay_seconds))
    }

    /// Rate-limit check for a ticket and command, using the configured window.
    pub fn check_rate_limit(&self, ticket_id: &str, command: &str) -> bool {
        let key = rate_limit_key(ticket_id, command);
        let blocked = self.rate_limit(
            &key,
            self.config.rate_limit_attempts,
            self.config.rate_limit_decay_secs,
        );
        if blocked {
            tracing::warn!(ticket_id, key = %key, "sandbox rate limit tripped");
        }
        blocked
    }
}

/// Rate-limit key: ticket id plus a short hash of the command.
pub fn rate_limit_key(ticket_id: &str, command: &str) -> String {
    let digest = Sha256::digest(command.as_bytes());
    let hash = format!("{:x}", digest);
    format!("{}:{}", ticket_id, &hash[..16])
}

/// Collapse whitespace and lower-case.
pub fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The identifying prefix of a tokenized command: `npm run lint`,
/// `composer test`, or just the program.
pub fn base_command(tokens: &[&str]) -> String {
    let Some(&program) = tokens.first() else {
        return String::new();
    };

    if SCRIPT_RUNNERS.contains(&program)
        && matches!(tokens.get(1), Some(&"run") | Some(&"run-script"))
        && let Some(script) = tokens.get(2)
    {
        return format!("{} run {}", program, script);
    }

    if SUBCOMMAND_TOOLS.contains(&program)
        && let Some(sub) = tokens.get(1)
        && !sub.starts_with('-')
    {
        return format!("{} {}", program, sub);
    }

    program.to_string()
}

/// Whether `base` matches an allowed entry exactly, by prefix, or by glob.
pub fn is_command_allowed(base: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        let entry = entry.trim().to_lowercase();
        if entry.is_empty() {
            return false;
        }
        if base == entry {
            return true;
        }
        if entry.contains(['*', '?', '[']) {
            return glob::Pattern::new(&entry)
                .map(|pattern| pattern.matches(base))
                .unwrap_or(false);
        }
        base.starts_with(&entry)
            && (entry.ends_with('/') || base[entry.len()..].starts_with([' ', '/', ':']))
    })
}
