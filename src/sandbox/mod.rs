//! Sandboxed command execution.
//!
//! `SandboxExecutor::run` is the entry point every stage uses to run
//! repository or generated code:
//!
//! 1. rate limit per ticket and command hash
//! 2. guard validation (fatal findings abort before anything spawns)
//! 3. image selection per language, with a generic fallback
//! 4. container invocation with isolation flags
//! 5. bounded capture under `min(requested, hard ceiling)`
//! 6. redaction, truncation and optional archiving
//!
//! Anything that goes wrong after validation (runtime missing, image pull
//! failure, timeout) comes back as a `ProcessResult`, never as an error.

pub mod archive;
pub mod capture;
pub mod invocation;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipwright_common::ObjectStore;

use crate::errors::SandboxError;
use crate::guard::{CommandGuard, TRUNCATION_MARKER, rate_limit_key};
use crate::profile::RepoProfile;

pub use archive::FsObjectStore;
pub use capture::{BoundedBuffer, CapturedOutput, TIMEOUT_EXIT_CODE, run_bounded};
pub use invocation::{CONTAINER_WORKSPACE, Invocation};

/// Exit code reported when the run never got going (spawn or runtime failure).
pub const INFRASTRUCTURE_EXIT_CODE: i32 = 125;

/// Built-in language → image table; `[sandbox.images]` entries take precedence.
const BUILTIN_IMAGES: &[(&str, &str)] = &[
    ("rust", "rust:1-slim"),
    ("node", "node:20-slim"),
    ("javascript", "node:20-slim"),
    ("typescript", "node:20-slim"),
    ("python", "python:3.12-slim"),
    ("php", "composer:2"),
    ("go", "golang:1.22"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime CLI (`docker`, `podman`).
    pub runtime: String,
    /// Language → image overrides.
    pub images: BTreeMap<String, String>,
    pub fallback_image: String,
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub tmp_size: String,
    pub user: String,
    pub hard_timeout_secs: u64,
    pub default_timeout_secs: u64,
    /// Per-stream capture cap in bytes.
    pub max_output_size: usize,
    /// Network joined when registry egress is enabled. It must only route
    /// through `egress_proxy`.
    pub egress_network: String,
    /// Filtering proxy that enforces `registry_hosts`. Without it the
    /// sandbox gets no network at all.
    pub egress_proxy: Option<String>,
    /// Package-registry hosts reachable through the proxy. Empty disables networking.
    pub registry_hosts: Vec<String>,
    /// Capabilities added back after `--cap-drop ALL`.
    pub capabilities: Vec<String>,
    pub archive_logs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            images: BTreeMap::new(),
            fallback_image: "debian:bookworm-slim".to_string(),
            memory: "1g".to_string(),
            cpus: 1.0,
            pids_limit: 256,
            tmp_size: "64m".to_string(),
            user: "1000:1000".to_string(),
            hard_timeout_secs: 600,
            default_timeout_secs: 300,
            max_output_size: 1024 * 1024,
            egress_network: "shipwright-egress".to_string(),
            egress_proxy: None,
            registry_hosts: [
                "registry.npmjs.org",
                "pypi.org",
                "files.pythonhosted.org",
                "index.crates.io",
                "static.crates.io",
                "repo.packagist.org",
                "proxy.golang.org",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            capabilities: vec!["CHOWN".to_string(), "DAC_OVERRIDE".to_string()],
            archive_logs: true,
        }
    }
}

impl SandboxConfig {
    /// Configured image for `language`, then the built-in table.
    pub fn image_for(&self, language: &str) -> Option<String> {
        let language = language.to_ascii_lowercase();
        self.images.get(&language).cloned().or_else(|| {
            BUILTIN_IMAGES
                .iter()
                .find(|(lang, _)| *lang == language)
                .map(|(_, image)| image.to_string())
        })
    }

    /// Registry egress needs both an allow-list and the proxy that enforces it.
    pub fn egress_enabled(&self) -> bool {
        !self.registry_hosts.is_empty() && self.egress_proxy.is_some()
    }

    /// `requested` (or the default) capped at the hard ceiling.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let hard = Duration::from_secs(self.hard_timeout_secs);
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or(Duration::from_secs(self.default_timeout_secs))
            .min(hard)
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default)]
    pub truncated: bool,
    /// Timeout that applied to the run, in seconds.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub log_paths: Vec<String>,
}

impl ProcessResult {
    /// Failure that happened before or around the process itself.
    pub fn infrastructure_failure(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: INFRASTRUCTURE_EXIT_CODE,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: duration.as_millis() as u64,
            timed_out: false,
            truncated: false,
            timeout_secs: 0,
            log_paths: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Turn a failed run into an error for callers that only care about success.
    pub fn into_success(self) -> Result<Self, SandboxError> {
        if self.timed_out {
            Err(SandboxError::SandboxTimeout {
                seconds: self.timeout_secs,
            })
        } else if self.exit_code != 0 {
            Err(SandboxError::NonZeroExit {
                code: self.exit_code,
            })
        } else {
            Ok(self)
        }
    }

    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// One execution request.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub workspace: PathBuf,
    pub command: String,
    pub language: String,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub profile: Option<RepoProfile>,
    pub allowed_paths: Vec<String>,
    pub ticket_id: Option<String>,
}

impl SandboxRequest {
    pub fn new(
        workspace: impl Into<PathBuf>,
        command: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            command: command.into(),
            language: language.into(),
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_profile(mut self, profile: RepoProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_allowed_paths(mut self, paths: Vec<String>) -> Self {
        self.allowed_paths = paths;
        self
    }

    pub fn with_ticket(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = Some(ticket_id.into());
        self
    }
}

/// Seam used by the testing stage to run required checks.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run_check(&self, request: &SandboxRequest) -> Result<ProcessResult, SandboxError>;
}

pub struct SandboxExecutor {
    config: SandboxConfig,
    guard: Arc<CommandGuard>,
    archive: Option<Arc<dyn ObjectStore>>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, guard: Arc<CommandGuard>) -> Self {
        Self {
            config,
            guard,
            archive: None,
        }
    }

    pub fn with_archive(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.archive = Some(store);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `request.command` in an isolated container.
    ///
    /// Errors only for rate limiting and fatal guard findings; both happen
    /// before any image is chosen or process spawned.
    pub async fn run(&self, request: &SandboxRequest) -> Result<ProcessResult, SandboxError> {
        let ticket = request.ticket_id.as_deref().unwrap_or("adhoc");
        if self.guard.check_rate_limit(ticket, &request.command) {
            return Err(SandboxError::RateLimited {
                key: rate_limit_key(ticket, &request.command),
            });
        }

        let validation = self.guard.validate_command(
            &request.command,
            request.profile.as_ref(),
            &request.allowed_paths,
        )?;
        if !validation.safe {
            tracing::warn!(
                command = %validation.normalized,
                violations = ?validation.violations,
                "Running command with guard violations"
            );
        }

        let image = self.select_image(&request.language);
        let invocation_id = uuid::Uuid::new_v4().simple().to_string();
        let container_name = format!("shipwright-{}", &invocation_id[..12]);
        let invocation = Invocation::sandboxed(
            &self.config,
            &image,
            &request.workspace,
            &request.command,
            &request.env,
            &container_name,
        );
        let limit = self.config.effective_timeout(request.timeout);

        tracing::info!(
            image = %image,
            container = %container_name,
            timeout_secs = limit.as_secs(),
            "Running sandboxed command"
        );

        let mut result = self.execute(&invocation, limit).await;

        if result.timed_out || result.exit_code == INFRASTRUCTURE_EXIT_CODE {
            self.cleanup(&invocation).await;
        }

        if self.config.archive_logs
            && let Some(store) = &self.archive
        {
            match archive::archive_output(
                store.as_ref(),
                request.ticket_id.as_deref(),
                &invocation_id,
                &result.stdout,
                &result.stderr,
            )
            .await
            {
                Ok(paths) => result.log_paths = paths,
                Err(e) => tracing::warn!(error = %e, "Failed to archive sandbox output"),
            }
        }

        Ok(result)
    }

    /// Trusted local execution: no guard, no isolation, same timeout and capture.
    pub async fn run_direct(&self, request: &SandboxRequest) -> ProcessResult {
        let invocation = Invocation::direct(&request.workspace, &request.command, &request.env);
        let limit = self.config.effective_timeout(request.timeout);
        tracing::debug!(command = %request.command, "Running direct command");
        self.execute(&invocation, limit).await
    }

    fn select_image(&self, language: &str) -> String {
        self.config.image_for(language).unwrap_or_else(|| {
            tracing::warn!(
                language,
                fallback = %self.config.fallback_image,
                "No sandbox image for language, using fallback"
            );
            self.config.fallback_image.clone()
        })
    }

    async fn execute(&self, invocation: &Invocation, limit: Duration) -> ProcessResult {
        let started = Instant::now();
        let max_output = self.config.max_output_size;
        match run_bounded(invocation.to_command(), limit, max_output).await {
            Ok(captured) => {
                let (stdout, stdout_truncated) = self.finish_stream(captured.stdout);
                let (stderr, stderr_truncated) = self.finish_stream(captured.stderr);
                if captured.timed_out {
                    tracing::warn!(timeout_secs = limit.as_secs(), "Command timed out");
                }
                ProcessResult {
                    exit_code: captured.exit_code,
                    stdout,
                    stderr,
                    duration_ms: captured.duration.as_millis() as u64,
                    timed_out: captured.timed_out,
                    truncated: stdout_truncated || stderr_truncated,
                    timeout_secs: limit.as_secs(),
                    log_paths: Vec::new(),
                }
            }
            Err(e) => {
                tracing::error!(program = %invocation.program, error = %e, "Failed to start command");
                let mut result = ProcessResult::infrastructure_failure(
                    format!("Failed to start {}: {}", invocation.program, e),
                    started.elapsed(),
                );
                result.timeout_secs = limit.as_secs();
                result
            }
        }
    }

    /// Redact and bound one captured stream, keeping the marker single.
    fn finish_stream(&self, buffer: BoundedBuffer) -> (String, bool) {
        let (text, capped) = buffer.into_lossy();
        let sanitized = self
            .guard
            .sanitize_output(&text, self.config.max_output_size);
        if capped && !sanitized.truncated {
            (format!("{}{}", sanitized.output, TRUNCATION_MARKER), true)
        } else {
            (sanitized.output, capped || sanitized.truncated)
        }
    }

    async fn cleanup(&self, invocation: &Invocation) {
        let Some(mut command) = invocation.cleanup_command() else {
            return;
        };
        match tokio::time::timeout(Duration::from_secs(30), command.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Container cleanup failed"),
            Err(_) => tracing::warn!(
                container = ?invocation.container_name,
                "Container cleanup timed out"
            ),
        }
    }
}

#[async_trait]
impl CheckRunner for SandboxExecutor {
    async fn run_check(&self, request: &SandboxRequest) -> Result<ProcessResult, SandboxError> {
        self.run(request).await
    }
}
