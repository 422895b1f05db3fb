//! Workflow inspection and manual operations (`shipwright workflow`).
//!
//! Works on the file store under `.shipwright/workflows/` with an inert
//! dispatcher: transitions are persisted, stages are not run.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use shipwright::errors::WorkflowError;
use shipwright::workflow::{FileWorkflowStore, WorkflowMachine, WorkflowStatus};

use super::{load_config, print_json};
use crate::{Cli, WorkflowCommands};

pub async fn cmd_workflow(cli: &Cli, project_dir: &Path, command: WorkflowCommands) -> Result<ExitCode> {
    let config = load_config(cli, project_dir)?;
    config.ensure_directories()?;
    let machine = WorkflowMachine::inert(
        config.toml.workflow.clone(),
        Arc::new(FileWorkflowStore::new(config.workflows_dir())),
    );

    match command {
        WorkflowCommands::Start { ticket } => {
            let workflow = machine.start(&ticket).await?;
            print_json(&workflow.status())?;
        }
        WorkflowCommands::Transition { id, state } => {
            let workflow = machine.transition(&id, state).await?;
            print_json(&workflow.status())?;
        }
        WorkflowCommands::Cancel { id } => {
            let workflow = machine.cancel(&id).await?;
            print_json(&workflow.status())?;
        }
        WorkflowCommands::Retry { id } => {
            let workflow = machine.retry(&id).await?;
            print_json(&workflow.status())?;
        }
        WorkflowCommands::Status { id: Some(id) } => {
            print_json(&lookup(&machine, &id).await?)?;
        }
        WorkflowCommands::Status { id: None } => {
            print_json(&machine.list().await?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Resolve `key` as a workflow id, then as a ticket id.
async fn lookup(machine: &WorkflowMachine, key: &str) -> Result<WorkflowStatus, WorkflowError> {
    match machine.status(key).await {
        Err(WorkflowError::NotFound { .. }) => machine.status_for_ticket(key).await,
        other => other,
    }
}
