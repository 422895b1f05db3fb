//! Ticket-to-pull-request workflow: states, persistence, the state machine
//! and the stage handlers it dispatches.

pub mod machine;
pub mod model;
pub mod stages;
pub mod state;
pub mod store;

use serde::{Deserialize, Serialize};

pub use machine::{Dispatch, WorkflowMachine};
pub use model::{
    CheckOutcome, CheckReport, StageArtifacts, Workflow, WorkflowEvent, WorkflowStatus,
};
pub use stages::{StageDeps, StageHandler, StageOutcome, StageTable};
pub use state::{WorkflowState, can_transition};
pub use store::{FileWorkflowStore, MemoryWorkflowStore, WorkflowStore};

/// `[workflow]` section of `shipwright.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_retries: u32,
    /// Entries into FIXING allowed between (re)starts.
    pub max_fix_loops: u32,
    /// Pause before a dispatched stage starts.
    pub dispatch_delay_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_fix_loops: 3,
            dispatch_delay_ms: 50,
        }
    }
}
