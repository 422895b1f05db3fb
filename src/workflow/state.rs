use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Ingested,
    ContextReady,
    Planned,
    Implementing,
    Testing,
    Reviewing,
    Fixing,
    PrCreated,
    Done,
    Failed,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 10] = [
        Self::Ingested,
        Self::ContextReady,
        Self::Planned,
        Self::Implementing,
        Self::Testing,
        Self::Reviewing,
        Self::Fixing,
        Self::PrCreated,
        Self::Done,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "INGESTED",
            Self::ContextReady => "CONTEXT_READY",
            Self::Planned => "PLANNED",
            Self::Implementing => "IMPLEMENTING",
            Self::Testing => "TESTING",
            Self::Reviewing => "REVIEWING",
            Self::Fixing => "FIXING",
            Self::PrCreated => "PR_CREATED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Outgoing edges. `Failed -> Ingested` is only taken by a retry.
    pub fn allowed_targets(&self) -> &'static [WorkflowState] {
        match self {
            Self::Ingested => &[Self::ContextReady],
            Self::ContextReady => &[Self::Planned],
            Self::Planned => &[Self::Implementing],
            Self::Implementing => &[Self::Testing],
            Self::Testing => &[Self::Reviewing, Self::Fixing],
            Self::Reviewing => &[Self::Fixing, Self::PrCreated],
            Self::Fixing => &[Self::Testing],
            Self::PrCreated => &[Self::Done],
            Self::Done => &[],
            Self::Failed => &[Self::Ingested],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

pub fn can_transition(from: WorkflowState, to: WorkflowState) -> bool {
    from.allowed_targets().contains(&to)
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("Invalid workflow state: {}", s))
    }
}
