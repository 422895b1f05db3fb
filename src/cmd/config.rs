//! Configuration view and validation commands (`shipwright config`).

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;

use super::load_config;
use crate::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    let config_path = config.shipwright_dir.join("shipwright.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No shipwright.toml at {}, using defaults", config_path.display());
            }
            println!("# Effective values (with env/CLI overrides)");
            println!();
            print!("{}", config.toml.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid");
                return Ok(ExitCode::SUCCESS);
            }
            println!("Configuration warnings:");
            for warning in &warnings {
                println!("  - {}", warning);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
