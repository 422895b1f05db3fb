//! Policy and schema commands (`shipwright policy` and `shipwright schema`).

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use shipwright::errors::SchemaError;
use shipwright::policy::PolicyEnforcer;
use shipwright::schema::{PATCH_SCHEMA, PLAN_SCHEMA, SchemaValidator};

use super::{exit_status, load_config, print_json, read_json};
use crate::{Cli, PolicyCommands, SchemaCommands};

/// Exit 0 when the document passes, 1 otherwise.
pub fn cmd_policy(cli: &Cli, project_dir: &Path, command: PolicyCommands) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    let enforcer = PolicyEnforcer::new(config.toml.policy.clone())
        .context("Invalid include/exclude pattern in policy configuration")?;
    let validator = SchemaValidator::new();

    let result = match command {
        PolicyCommands::Plan { file } => {
            let (plan, _) = validator.validate_plan(&read_json(&file)?)?;
            enforcer.check_plan_compliance(&plan)
        }
        PolicyCommands::Patch { file, summary } => {
            let (patch, _) = validator.validate_patch(&read_json(&file)?)?;
            let result = enforcer.check_patch_compliance(&patch);
            if summary {
                print!("{}", result.to_review_summary().body);
                return Ok(exit_status(result.passed));
            }
            result
        }
    };

    print_json(&result)?;
    Ok(exit_status(result.passed))
}

pub fn cmd_schema(command: SchemaCommands) -> Result<ExitCode> {
    let validator = SchemaValidator::new();
    match command {
        SchemaCommands::List => {
            for name in SchemaValidator::schema_names() {
                println!("{}", name);
            }
            Ok(ExitCode::SUCCESS)
        }
        SchemaCommands::Validate { name, file } => {
            let data = read_json(&file)?;
            let mut result = validator.validate(&data, &name)?;

            // plans and patches also get their semantic rules
            if result.is_valid {
                let typed = match name.as_str() {
                    PLAN_SCHEMA => Some(validator.validate_plan(&data).map(|(_, r)| r)),
                    PATCH_SCHEMA => Some(validator.validate_patch(&data).map(|(_, r)| r)),
                    _ => None,
                };
                match typed {
                    Some(Ok(checked)) => result = checked,
                    Some(Err(SchemaError::ValidationFailed { errors, .. })) => {
                        result.is_valid = false;
                        result.errors = errors;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {}
                }
            }

            print_json(&result)?;
            Ok(exit_status(result.is_valid))
        }
    }
}
