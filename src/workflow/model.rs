//! Persisted workflow record, its event log and stage artifacts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipwright_common::{Patch, Plan, Ticket};

use super::state::WorkflowState;
use crate::errors::ErrorKind;
use crate::policy::{PolicyCheckResult, ReviewSummary};
use crate::profile::RepoProfile;

/// Append-only audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        at: DateTime<Utc>,
    },
    Transitioned {
        from: WorkflowState,
        to: WorkflowState,
        at: DateTime<Utc>,
    },
    Failed {
        from: WorkflowState,
        stage: String,
        error: String,
        kind: ErrorKind,
        at: DateTime<Utc>,
    },
    Cancelled {
        from: WorkflowState,
        at: DateTime<Utc>,
    },
    Retried {
        attempt: u32,
        at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Started { at }
            | Self::Transitioned { at, .. }
            | Self::Failed { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Retried { at, .. } => *at,
        }
    }
}

/// Result of one required check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub command: Option<String>,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Tail of the sanitized output, for fix prompts and the audit trail.
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl CheckReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    /// One line per failed check.
    pub fn failures(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| {
                let reason = if o.timed_out {
                    "timed out".to_string()
                } else {
                    format!("exit code {}", o.exit_code.unwrap_or(-1))
                };
                format!("Check '{}' failed ({}):\n{}", o.name, reason, o.output)
            })
            .collect()
    }
}

/// Everything the stages produce, persisted with the transition that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageArtifacts {
    pub ticket: Option<Ticket>,
    pub workspace: Option<PathBuf>,
    pub branch: Option<String>,
    pub language: Option<String>,
    pub profile: Option<RepoProfile>,
    pub files: Vec<String>,
    pub plan: Option<Plan>,
    pub plan_compliance: Option<PolicyCheckResult>,
    pub patch: Option<Patch>,
    pub patch_compliance: Option<PolicyCheckResult>,
    pub commits: Vec<String>,
    pub check_report: Option<CheckReport>,
    pub review: Option<ReviewSummary>,
    pub review_comments: Vec<String>,
    pub pull_request_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub ticket_id: String,
    pub state: WorkflowState,
    pub retries: u32,
    /// Entries into FIXING since the last (re)start.
    #[serde(default)]
    pub fix_loops: u32,
    /// Bumped on every persisted change; the compare-and-set key.
    pub version: u64,
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
    #[serde(default)]
    pub artifacts: StageArtifacts,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: ticket_id.into(),
            state: WorkflowState::Ingested,
            retries: 0,
            fix_loops: 0,
            version: 1,
            events: vec![WorkflowEvent::Started { at: now }],
            artifacts: StageArtifacts::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append `event`, bump the version and touch `updated_at`.
    pub(crate) fn record(&mut self, event: WorkflowEvent) {
        self.updated_at = event.at();
        self.events.push(event);
        self.version += 1;
    }

    pub fn transitions(&self) -> impl Iterator<Item = (WorkflowState, WorkflowState)> + '_ {
        self.events.iter().filter_map(|e| match e {
            WorkflowEvent::Transitioned { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.state == WorkflowState::Failed
            && matches!(self.events.last(), Some(WorkflowEvent::Cancelled { .. }))
    }

    pub fn status(&self) -> WorkflowStatus {
        let end = if self.state.is_terminal() {
            self.updated_at
        } else {
            Utc::now()
        };
        WorkflowStatus {
            id: self.id.clone(),
            ticket_id: self.ticket_id.clone(),
            state: self.state,
            retries: self.retries,
            fix_loops: self.fix_loops,
            elapsed_secs: (end - self.created_at).num_seconds().max(0),
            is_complete: self.state == WorkflowState::Done,
            is_failed: self.state == WorkflowState::Failed,
            cancelled: self.was_cancelled(),
            last_error: self.last_error.clone(),
            reachable: self.state.allowed_targets().to_vec(),
            pull_request_url: self.artifacts.pull_request_url.clone(),
        }
    }
}

/// Introspection summary for the CLI and API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub id: String,
    pub ticket_id: String,
    pub state: WorkflowState,
    pub retries: u32,
    pub fix_loops: u32,
    pub elapsed_secs: i64,
    pub is_complete: bool,
    pub is_failed: bool,
    pub cancelled: bool,
    pub last_error: Option<String>,
    pub reachable: Vec<WorkflowState>,
    pub pull_request_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_workflow() {
        let wf = Workflow::new("T-1");
        assert_eq!(wf.state, WorkflowState::Ingested);
        assert_eq!(wf.version, 1);
        assert!(matches!(wf.events[0], WorkflowEvent::Started { .. }));
        let status = wf.status();
        assert_eq!(status.reachable, vec![WorkflowState::ContextReady]);
        assert!(!status.is_complete && !status.is_failed && !status.cancelled);
    }

    #[test]
    fn test_event_log_serializes_tagged() {
        let event = WorkflowEvent::Failed {
            from: WorkflowState::Testing,
            stage: "run_checks".into(),
            error: "boom".into(),
            kind: ErrorKind::StageExecutionFailed,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["from"], "TESTING");
        assert_eq!(json["kind"], "StageExecutionFailed");
    }

    #[test]
    fn test_record_bumps_version() {
        let mut wf = Workflow::new("T-1");
        wf.record(WorkflowEvent::Transitioned {
            from: WorkflowState::Ingested,
            to: WorkflowState::ContextReady,
            at: Utc::now(),
        });
        assert_eq!(wf.version, 2);
        assert_eq!(wf.transitions().count(), 1);
    }

    #[test]
    fn test_check_report_failures() {
        let report = CheckReport {
            outcomes: vec![
                CheckOutcome {
                    name: "lint".into(),
                    command: Some("cargo clippy".into()),
                    passed: true,
                    exit_code: Some(0),
                    timed_out: false,
                    output: String::new(),
                },
                CheckOutcome {
                    name: "unit_tests".into(),
                    command: Some("cargo test".into()),
                    passed: false,
                    exit_code: Some(101),
                    timed_out: false,
                    output: "assertion failed".into(),
                },
            ],
        };
        assert!(!report.all_passed());
        assert_eq!(
            report.failures(),
            vec!["Check 'unit_tests' failed (exit code 101):\nassertion failed"]
        );
    }
}
