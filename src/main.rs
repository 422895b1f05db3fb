use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shipwright::logging::{self, LogFormat};
use shipwright::workflow::WorkflowState;

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Ticket-to-pull-request automation with policy gates and sandboxed checks")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily-rotated file in this directory
    #[arg(long, env = "SHIPWRIGHT_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Overrides workflow.max_retries
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a command against the guard and print the result as JSON
    Guard {
        /// Apply the allow-list of this language's repo profile
        #[arg(short, long)]
        language: Option<String>,

        /// Extra directory the command may reference
        #[arg(long = "allow-path")]
        allow_paths: Vec<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Redact secrets from stdin and bound its size
    Sanitize {
        #[arg(long, default_value_t = 1024 * 1024)]
        max_size: usize,
    },
    /// Run commands in the sandbox
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// Check a plan or patch against policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Validate documents against the embedded schemas
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Inspect and operate persisted workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SandboxCommands {
    Run {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Defaults to the language detected in the workspace
        #[arg(short, long)]
        language: Option<String>,

        /// Timeout in seconds, capped by sandbox.hard_timeout_secs
        #[arg(long)]
        timeout: Option<u64>,

        /// Run on the host without the container runtime or the guard
        #[arg(long)]
        direct: bool,

        #[arg(long)]
        ticket: Option<String>,

        /// Extra path the command may reference (repeatable)
        #[arg(long = "allow-path")]
        allow_paths: Vec<String>,

        /// KEY=VALUE passed to the command
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Print the full result as JSON instead of replaying the streams
        #[arg(long)]
        json: bool,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PolicyCommands {
    /// Check a plan JSON file
    Plan { file: PathBuf },
    /// Check a patch JSON file
    Patch {
        file: PathBuf,
        /// Print the markdown review summary instead of the JSON result
        #[arg(long)]
        summary: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum SchemaCommands {
    /// List the embedded schemas
    List,
    Validate { name: String, file: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Create the workflow for a ticket (returns the existing one if present)
    Start { ticket: String },
    Transition { id: String, state: WorkflowState },
    Cancel { id: String },
    Retry { id: String },
    /// Status of one workflow (by id or ticket), or all of them
    Status { id: Option<String> },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Report configuration warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_format, cli.log_dir.as_deref());

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Guard {
            language,
            allow_paths,
            command,
        } => cmd::cmd_guard(&cli, &project_dir, language.as_deref(), allow_paths, command),
        Commands::Sanitize { max_size } => cmd::cmd_sanitize(*max_size),
        Commands::Sandbox { command } => cmd::cmd_sandbox(&cli, &project_dir, command.clone()).await,
        Commands::Policy { command } => cmd::cmd_policy(&cli, &project_dir, command.clone()),
        Commands::Schema { command } => cmd::cmd_schema(command.clone()),
        Commands::Workflow { command } => {
            cmd::cmd_workflow(&cli, &project_dir, command.clone()).await
        }
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone()),
    }
}
