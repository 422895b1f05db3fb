//! shipwright: drives a ticket from ingestion to an opened pull request.
//!
//! The workflow state machine dispatches one stage per state; AI-produced
//! plans and patches pass the schema validator and the policy enforcer, and
//! every command runs through the command guard and the sandbox executor.

pub mod config;
pub mod errors;
pub mod guard;
pub mod logging;
pub mod policy;
pub mod profile;
pub mod sandbox;
pub mod schema;
pub mod workflow;
