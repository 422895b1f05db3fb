//! Command guard commands (`shipwright guard` and `shipwright sanitize`).

use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use shipwright::guard::CommandGuard;

use super::{exit_status, load_config, print_json};
use crate::Cli;

/// Exit 0 when the command is safe, 1 when it has violations or is blocked.
pub fn cmd_guard(
    cli: &Cli,
    project_dir: &Path,
    language: Option<&str>,
    allow_paths: &[String],
    command: &[String],
) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    let profile = match language {
        Some(language) => Some(
            config
                .toml
                .profile_for(language)
                .with_context(|| format!("No repo profile for language '{}'", language))?,
        ),
        None => None,
    };

    let guard = CommandGuard::new(config.toml.guard.clone());
    let command = command.join(" ");
    let validation = guard.validate_command(&command, profile.as_ref(), allow_paths)?;
    print_json(&validation)?;
    Ok(exit_status(validation.safe))
}

pub fn cmd_sanitize(max_size: usize) -> Result<ExitCode> {
    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .context("Failed to read stdin")?;
    let text = String::from_utf8_lossy(&input);

    let sanitized = shipwright::guard::sanitize_output(&text, max_size);
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(sanitized.output.as_bytes())
        .context("Failed to write output")?;
    stdout.flush().context("Failed to write output")?;
    Ok(ExitCode::SUCCESS)
}
