//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `guard`         | `Guard`, `Sanitize`                                |
//! | `sandbox`       | `Sandbox`                                          |
//! | `policy`        | `Policy`, `Schema`                                 |
//! | `workflow`      | `Workflow`                                         |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod guard;
pub mod policy;
pub mod sandbox;
pub mod workflow;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Serialize;
use shipwright::config::ShipwrightConfig;

use crate::Cli;

pub use config::cmd_config;
pub use guard::{cmd_guard, cmd_sanitize};
pub use policy::{cmd_policy, cmd_schema};
pub use sandbox::cmd_sandbox;
pub use workflow::cmd_workflow;

fn load_config(cli: &Cli, project_dir: &Path) -> Result<ShipwrightConfig> {
    ShipwrightConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, cli.max_retries)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn exit_status(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
