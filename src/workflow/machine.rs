//! The workflow state machine.
//!
//! Every mutation is a read-validate-write against the store's
//! compare-and-set. The next stage is dispatched only by the operation that
//! persisted the state it runs for, so a workflow never has two stage jobs
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shipwright_common::{TicketSource, TicketStatus};

use super::WorkflowConfig;
use super::model::{StageArtifacts, Workflow, WorkflowEvent, WorkflowStatus};
use super::stages::{StageOutcome, StageTable};
use super::state::{WorkflowState, can_transition};
use super::store::WorkflowStore;
use crate::errors::{ErrorKind, WorkflowError};

/// How persisted states turn into stage jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Spawn the stage on the tokio runtime after `dispatch_delay_ms`.
    Spawn,
    /// Persist only. Used by the CLI for manual operations.
    Inert,
}

struct Inner {
    config: WorkflowConfig,
    store: Arc<dyn WorkflowStore>,
    stages: StageTable,
    tickets: Option<Arc<dyn TicketSource>>,
    dispatch: Dispatch,
}

#[derive(Clone)]
pub struct WorkflowMachine {
    inner: Arc<Inner>,
}

impl WorkflowMachine {
    pub fn new(config: WorkflowConfig, store: Arc<dyn WorkflowStore>, stages: StageTable) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                stages,
                tickets: None,
                dispatch: Dispatch::Spawn,
            }),
        }
    }

    /// Machine that persists transitions but never runs stages.
    pub fn inert(config: WorkflowConfig, store: Arc<dyn WorkflowStore>) -> Self {
        Self::new(config, store, StageTable::new()).with_dispatch(Dispatch::Inert)
    }

    /// Ticket system used for failure and cancellation feedback.
    pub fn with_tickets(self, tickets: Arc<dyn TicketSource>) -> Self {
        self.rebuild(|inner| inner.tickets = Some(tickets))
    }

    pub fn with_dispatch(self, dispatch: Dispatch) -> Self {
        self.rebuild(|inner| inner.dispatch = dispatch)
    }

    fn rebuild(self, edit: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => Inner {
                config: shared.config.clone(),
                store: Arc::clone(&shared.store),
                stages: shared.stages.clone(),
                tickets: shared.tickets.clone(),
                dispatch: shared.dispatch,
            },
        };
        edit(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn stages(&self) -> &StageTable {
        &self.inner.stages
    }

    /// Create the ticket's workflow at INGESTED and dispatch its first stage.
    /// If the ticket already has a workflow it is returned unchanged and
    /// nothing is dispatched.
    pub async fn start(&self, ticket_id: &str) -> Result<Workflow, WorkflowError> {
        match self.create(ticket_id).await {
            Ok(workflow) => Ok(workflow),
            Err(WorkflowError::AlreadyExists { id, .. }) => self.load(&id).await,
            Err(e) => Err(e),
        }
    }

    /// Like `start`, but an existing workflow for the ticket is an error.
    pub async fn start_workflow(&self, ticket_id: &str) -> Result<String, WorkflowError> {
        self.create(ticket_id).await.map(|w| w.id)
    }

    async fn create(&self, ticket_id: &str) -> Result<Workflow, WorkflowError> {
        let workflow = Workflow::new(ticket_id);
        self.inner.store.insert_new(&workflow).await?;
        tracing::info!(workflow_id = %workflow.id, ticket_id, "Workflow started");
        self.dispatch_next(&workflow);
        Ok(workflow)
    }

    /// Move along an edge of the transition table.
    ///
    /// `FAILED -> INGESTED` is the retry edge and goes through `retry`.
    pub async fn transition(
        &self,
        id: &str,
        target: WorkflowState,
    ) -> Result<Workflow, WorkflowError> {
        let current = self.load(id).await?;
        if current.state == WorkflowState::Failed && target == WorkflowState::Ingested {
            return self.retry(id).await;
        }
        self.apply(current, target, None).await
    }

    /// Force a non-terminal workflow to FAILED, marked as cancelled.
    /// An in-flight stage notices at its next dispatch point.
    pub async fn cancel(&self, id: &str) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.load(id).await?;
        if workflow.state.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                state: workflow.state,
            });
        }
        let expected = workflow.version;
        let from = workflow.state;
        workflow.state = WorkflowState::Failed;
        workflow.last_error = Some("Cancelled".to_string());
        workflow.record(WorkflowEvent::Cancelled { from, at: Utc::now() });
        self.inner.store.compare_and_swap(expected, &workflow).await?;

        tracing::info!(workflow_id = %workflow.id, from = %from, "Workflow cancelled");
        self.notify(
            &workflow.ticket_id,
            &format!("Automation cancelled while {}.", from),
            TicketStatus::Blocked,
        )
        .await;
        Ok(workflow)
    }

    /// Restart a FAILED workflow from INGESTED, up to `max_retries` times.
    pub async fn retry(&self, id: &str) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.load(id).await?;
        if workflow.state != WorkflowState::Failed {
            return Err(WorkflowError::NotRetryable {
                state: workflow.state,
            });
        }
        let max = self.inner.config.max_retries;
        if workflow.retries >= max {
            return Err(WorkflowError::RetryLimitExceeded {
                retries: workflow.retries,
                max,
            });
        }

        let expected = workflow.version;
        workflow.retries += 1;
        workflow.fix_loops = 0;
        workflow.state = WorkflowState::Ingested;
        workflow.last_error = None;
        workflow.artifacts = StageArtifacts::default();
        workflow.record(WorkflowEvent::Retried {
            attempt: workflow.retries,
            at: Utc::now(),
        });
        self.inner.store.compare_and_swap(expected, &workflow).await?;

        tracing::info!(workflow_id = %workflow.id, attempt = workflow.retries, "Workflow retried");
        self.dispatch_next(&workflow);
        Ok(workflow)
    }

    pub async fn status(&self, id: &str) -> Result<WorkflowStatus, WorkflowError> {
        Ok(self.load(id).await?.status())
    }

    pub async fn status_for_ticket(&self, ticket_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        self.inner
            .store
            .find_by_ticket(ticket_id)
            .await?
            .map(|w| w.status())
            .ok_or_else(|| WorkflowError::NotFound {
                id: ticket_id.to_string(),
            })
    }

    pub async fn list(&self) -> Result<Vec<WorkflowStatus>, WorkflowError> {
        Ok(self
            .inner
            .store
            .list()
            .await?
            .iter()
            .map(Workflow::status)
            .collect())
    }

    /// Move a non-terminal workflow to FAILED, recording what broke.
    pub async fn fail(
        &self,
        id: &str,
        stage: &str,
        error: &WorkflowError,
    ) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.load(id).await?;
        if workflow.state.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                state: workflow.state,
            });
        }
        let expected = workflow.version;
        self.mark_failed(&mut workflow, stage, error.to_string(), error.kind());
        self.inner.store.compare_and_swap(expected, &workflow).await?;
        self.after_failure(&workflow, stage).await;
        Ok(workflow)
    }

    fn mark_failed(&self, workflow: &mut Workflow, stage: &str, error: String, kind: ErrorKind) {
        let from = workflow.state;
        workflow.state = WorkflowState::Failed;
        workflow.last_error = Some(error.clone());
        workflow.record(WorkflowEvent::Failed {
            from,
            stage: stage.to_string(),
            error,
            kind,
            at: Utc::now(),
        });
    }

    async fn after_failure(&self, workflow: &Workflow, stage: &str) {
        let error = workflow.last_error.as_deref().unwrap_or("unknown error");
        tracing::error!(workflow_id = %workflow.id, stage, error, "Workflow failed");
        self.notify(
            &workflow.ticket_id,
            &format!("Automation failed during {}: {}", stage, error),
            TicketStatus::Blocked,
        )
        .await;
    }

    /// Validate and persist `current -> target`, then dispatch.
    async fn apply(
        &self,
        mut workflow: Workflow,
        target: WorkflowState,
        outcome_artifacts: Option<StageArtifacts>,
    ) -> Result<Workflow, WorkflowError> {
        let from = workflow.state;
        if !can_transition(from, target) || target == WorkflowState::Ingested {
            return Err(WorkflowError::InvalidTransition { from, to: target });
        }

        let expected = workflow.version;
        if let Some(artifacts) = outcome_artifacts {
            workflow.artifacts = artifacts;
        }

        if target == WorkflowState::Fixing {
            workflow.fix_loops += 1;
            let max = self.inner.config.max_fix_loops;
            if workflow.fix_loops > max {
                let error = WorkflowError::StageExecutionFailed {
                    stage: "fix".to_string(),
                    message: format!("Fix loop limit exceeded ({}/{})", workflow.fix_loops - 1, max),
                };
                self.mark_failed(&mut workflow, "fix", error.to_string(), error.kind());
                self.inner.store.compare_and_swap(expected, &workflow).await?;
                self.after_failure(&workflow, "fix").await;
                return Ok(workflow);
            }
        }

        workflow.state = target;
        workflow.record(WorkflowEvent::Transitioned {
            from,
            to: target,
            at: Utc::now(),
        });
        self.inner.store.compare_and_swap(expected, &workflow).await?;

        tracing::info!(workflow_id = %workflow.id, from = %from, to = %target, "Workflow transitioned");
        self.dispatch_next(&workflow);
        Ok(workflow)
    }

    /// Schedule the stage for the workflow's current state.
    pub fn dispatch_next(&self, workflow: &Workflow) {
        if self.inner.dispatch == Dispatch::Inert || workflow.state.is_terminal() {
            return;
        }
        if self.inner.stages.get(workflow.state).is_none() {
            tracing::debug!(state = %workflow.state, "No stage registered");
            return;
        }
        let machine = self.clone();
        let id = workflow.id.clone();
        let state = workflow.state;
        let delay = Duration::from_millis(self.inner.config.dispatch_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            machine.run_stage(&id, state).await;
        });
    }

    /// Run the stage registered for `state`, if the workflow is still there.
    pub async fn run_stage(&self, id: &str, state: WorkflowState) {
        let workflow = match self.load(id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                tracing::warn!(workflow_id = id, error = %e, "Dropping stage for unreadable workflow");
                return;
            }
        };
        if workflow.state != state {
            tracing::debug!(
                workflow_id = id,
                dispatched = %state,
                current = %workflow.state,
                "Workflow moved on, dropping stale stage"
            );
            return;
        }
        let Some(handler) = self.inner.stages.get(state) else {
            return;
        };

        let stage = handler.name();
        tracing::info!(workflow_id = id, stage, "Running stage");
        let result = handler.run(&workflow).await;

        let persisted = match result {
            Ok(StageOutcome { next, artifacts }) => {
                match self.reload_if_current(id, state).await {
                    Some(current) => self.apply(current, next, Some(artifacts)).await.map(|_| ()),
                    None => Ok(()),
                }
            }
            Err(error) => {
                tracing::warn!(workflow_id = id, stage, error = %error, "Stage failed");
                match self.reload_if_current(id, state).await {
                    Some(mut current) => {
                        let expected = current.version;
                        self.mark_failed(&mut current, stage, error.to_string(), error.kind());
                        match self.inner.store.compare_and_swap(expected, &current).await {
                            Ok(()) => {
                                self.after_failure(&current, stage).await;
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => Ok(()),
                }
            }
        };

        if let Err(e) = persisted {
            tracing::error!(workflow_id = id, stage, error = %e, "Failed to persist stage outcome");
        }
    }

    /// Reload; `None` when the workflow left `state` while the stage ran
    /// (cancelled, or moved by hand).
    async fn reload_if_current(&self, id: &str, state: WorkflowState) -> Option<Workflow> {
        match self.load(id).await {
            Ok(w) if w.state == state => Some(w),
            Ok(w) => {
                tracing::info!(
                    workflow_id = id,
                    expected = %state,
                    current = %w.state,
                    "Discarding stage outcome for a workflow that moved on"
                );
                None
            }
            Err(e) => {
                tracing::warn!(workflow_id = id, error = %e, "Failed to reload workflow");
                None
            }
        }
    }

    async fn load(&self, id: &str) -> Result<Workflow, WorkflowError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound { id: id.to_string() })
    }

    async fn notify(&self, ticket_id: &str, text: &str, status: TicketStatus) {
        let Some(tickets) = &self.inner.tickets else {
            return;
        };
        if let Err(e) = tickets.comment(ticket_id, text).await {
            tracing::warn!(ticket_id, error = %e, "Failed to comment on ticket");
        }
        if let Err(e) = tickets.transition_status(ticket_id, status).await {
            tracing::warn!(ticket_id, error = %e, "Failed to update ticket status");
        }
    }
}
