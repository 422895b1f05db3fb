//! `shipwright sandbox run`.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use shipwright::guard::CommandGuard;
use shipwright::profile::detect_language;
use shipwright::sandbox::{FsObjectStore, SandboxExecutor, SandboxRequest};

use super::{load_config, print_json};
use crate::{Cli, SandboxCommands};

pub async fn cmd_sandbox(cli: &Cli, project_dir: &Path, command: SandboxCommands) -> Result<ExitCode> {
    let SandboxCommands::Run {
        workspace,
        language,
        timeout,
        direct,
        ticket,
        allow_paths,
        env,
        json,
        command,
    } = command;

    let config = load_config(cli, project_dir)?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
    let language = language.unwrap_or_else(|| detect_language(&workspace).to_string());

    let mut request = SandboxRequest::new(&workspace, command.join(" "), &language);
    for pair in &env {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid --env '{}', expected KEY=VALUE", pair);
        };
        request = request.with_env(key, value);
    }
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    if let Some(ticket) = ticket {
        request = request.with_ticket(ticket);
    }
    if !allow_paths.is_empty() {
        request = request.with_allowed_paths(allow_paths);
    }
    if let Some(profile) = config.toml.profile_for(&language) {
        request = request.with_profile(profile);
    }

    let guard = Arc::new(CommandGuard::new(config.toml.guard.clone()));
    let mut executor = SandboxExecutor::new(config.toml.sandbox.clone(), guard);
    if config.toml.sandbox.archive_logs && !direct {
        executor = executor.with_archive(Arc::new(FsObjectStore::new(config.archive_dir())));
    }

    let result = if direct {
        executor.run_direct(&request).await
    } else {
        executor.run(&request).await?
    };

    if json {
        print_json(&result)?;
    } else {
        std::io::stdout()
            .write_all(result.stdout.as_bytes())
            .context("Failed to write stdout")?;
        std::io::stderr()
            .write_all(result.stderr.as_bytes())
            .context("Failed to write stderr")?;
    }
    if result.timed_out {
        tracing::warn!(timeout_secs = result.timeout_secs, "Sandbox run timed out");
    }

    let code = u8::try_from(result.exit_code).unwrap_or(1);
    Ok(ExitCode::from(code))
}
