//! Path extraction and allow-list enforcement for guarded commands.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::GuardError;

/// Directories a command may always reference.
pub const FIXED_ALLOWED_PATHS: &[&str] = &[
    "/workspace",
    "/tmp",
    "/usr/bin",
    "/usr/local/bin",
    "/bin",
    "/opt",
];

/// System directories that are rejected even when an allow-list entry covers them.
pub const RESTRICTED_PATHS: &[&str] = &[
    "/etc",
    "/root",
    "/proc",
    "/sys",
    "/dev",
    "/boot",
    "/run",
    "/var/run",
    "/var/lib/docker",
    "/sbin",
    "/usr/sbin",
    "/home",
];

/// Union of the fixed allow-list, the workspace, and caller-supplied paths.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    workspace: PathBuf,
    allowed: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(workspace: &str, configured: &[String]) -> Self {
        let workspace = PathBuf::from(workspace);
        let mut allowed: Vec<PathBuf> = FIXED_ALLOWED_PATHS.iter().map(PathBuf::from).collect();
        allowed.push(workspace.clone());
        allowed.extend(configured.iter().map(PathBuf::from));
        Self { workspace, allowed }
    }

    pub fn with_extra(mut self, extra: &[String]) -> Self {
        self.allowed.extend(extra.iter().map(PathBuf::from));
        self
    }

    /// Check every path-like argument of `command`.
    pub fn check_command(&self, command: &str) -> Result<(), GuardError> {
        for candidate in extract_paths(command) {
            self.check_path(&candidate)?;
        }
        Ok(())
    }

    pub fn check_path(&self, raw: &str) -> Result<(), GuardError> {
        if raw.split('/').any(|segment| segment.contains("..")) {
            return Err(GuardError::path(raw, "parent directory segments are not allowed"));
        }

        let resolved = self.resolve(raw);

        if let Some(restricted) = RESTRICTED_PATHS
            .iter()
            .find(|dir| resolved.starts_with(dir))
        {
            return Err(GuardError::path(
                raw,
                format!("restricted system directory {}", restricted),
            ));
        }

        if self.allowed.iter().any(|root| resolved.starts_with(root)) {
            Ok(())
        } else {
            Err(GuardError::path(raw, "outside allowed directories"))
        }
    }

    /// Absolute paths stay as they are; relative ones resolve against the workspace.
    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        };
        joined
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }
}

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[A-Za-z][A-Za-z0-9+.\-]*://[^\s"']*"#).expect("url regex is valid")
});

/// Short option glued to a path: `-I/etc`, `-L/usr/lib`.
static SHORT_FLAG_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^-[A-Za-z]+(/[^\s"'(),;:=]*)"#).expect("short flag regex is valid")
});

/// Absolute path starting after a non-path character: `open('/root/x')`,
/// `PATH=/bin:/etc`.
static EMBEDDED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^A-Za-z0-9._~/\-])(/[^\s"'(),;:=]*)"#).expect("embedded path regex is valid")
});

/// Every path-like substring in `command`: absolute paths (including ones
/// embedded in a token or glued to a short option), anything with a `..`
/// segment, and `vendor/bin/...` executables. `--opt=value` arguments are
/// split at the first `=`. URLs are not paths.
pub fn extract_paths(command: &str) -> Vec<String> {
    let without_urls = URL_REGEX.replace_all(command, " ");
    let mut paths = Vec::new();
    for token in without_urls.split_whitespace() {
        let token = match token.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => value,
            _ => token,
        };
        let token = token.trim_matches(|c| c == '"' || c == '\'');
        if let Some(caps) = SHORT_FLAG_PATH.captures(token) {
            paths.push(caps[1].to_string());
        } else if is_path_like(token) && !token.starts_with('/') {
            paths.push(token.to_string());
        } else {
            paths.extend(
                EMBEDDED_PATH
                    .captures_iter(token)
                    .map(|caps| caps[1].to_string()),
            );
        }
    }
    paths
}

fn is_path_like(token: &str) -> bool {
    token.starts_with('/')
        || token == ".."
        || token.starts_with("../")
        || token.contains("/../")
        || token.ends_with("/..")
        || token.starts_with("vendor/bin/")
}
