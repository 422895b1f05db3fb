//! Stage handlers, one per non-terminal state.
//!
//! A handler reads the workflow as persisted, talks to its collaborators and
//! returns the next state together with the updated artifacts. It never
//! writes to the store; the machine persists the outcome through the normal
//! transition table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use shipwright_common::{
    CodeHost, FixInput, ImplementationInput, Implementer, Patch, Plan, Planner, PlanningInput,
    PullRequestRequest, RepoContext, ReviewInput, Reviewer, StageFailure, Ticket, TicketSource,
    TicketStatus,
};

use super::model::{CheckOutcome, CheckReport, StageArtifacts, Workflow};
use super::state::WorkflowState;
use crate::errors::WorkflowError;
use crate::policy::{PolicyCheckResult, PolicyEnforcer, ReviewStatus};
use crate::profile::{RepoProfile, detect_language};
use crate::sandbox::{CheckRunner, SandboxExecutor, SandboxRequest};
use crate::schema::SchemaValidator;

/// Characters of check output kept for fix prompts.
const CHECK_OUTPUT_TAIL: usize = 4000;

pub struct StageOutcome {
    pub next: WorkflowState,
    pub artifacts: StageArtifacts,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError>;
}

#[derive(Clone, Default)]
pub struct StageTable {
    handlers: HashMap<WorkflowState, Arc<dyn StageHandler>>,
}

impl StageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, state: WorkflowState, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(state, handler);
        self
    }

    pub fn get(&self, state: WorkflowState) -> Option<&Arc<dyn StageHandler>> {
        self.handlers.get(&state)
    }

    /// The full ticket-to-PR pipeline.
    pub fn pipeline(deps: Arc<StageDeps>) -> Self {
        use WorkflowState::*;
        Self::new()
            .with(Ingested, Arc::new(BuildContext(Arc::clone(&deps))))
            .with(ContextReady, Arc::new(PlanStage(Arc::clone(&deps))))
            .with(Planned, Arc::new(BeginImplementation(Arc::clone(&deps))))
            .with(Implementing, Arc::new(Implement(Arc::clone(&deps))))
            .with(Testing, Arc::new(RunChecks(Arc::clone(&deps))))
            .with(Reviewing, Arc::new(Review(Arc::clone(&deps))))
            .with(Fixing, Arc::new(Fix(Arc::clone(&deps))))
            .with(PrCreated, Arc::new(Complete))
    }
}

/// Collaborators and components the stages drive.
pub struct StageDeps {
    pub tickets: Arc<dyn TicketSource>,
    pub code_host: Arc<dyn CodeHost>,
    pub planner: Arc<dyn Planner>,
    pub implementer: Arc<dyn Implementer>,
    pub reviewer: Arc<dyn Reviewer>,
    pub checks: Arc<dyn CheckRunner>,
    /// Runs trusted introspection commands (`git ls-files`) on the host.
    pub introspect: Option<Arc<SandboxExecutor>>,
    pub schema: Arc<SchemaValidator>,
    pub policy: Arc<PolicyEnforcer>,
    /// Configured profiles; built-in profiles fill in the rest.
    pub profiles: Vec<RepoProfile>,
    /// Directory under which each workflow gets its checkout.
    pub workspace_root: PathBuf,
}

impl StageDeps {
    fn profile_for(&self, language: &str) -> RepoProfile {
        self.profiles
            .iter()
            .find(|p| p.language.eq_ignore_ascii_case(language))
            .cloned()
            .or_else(|| RepoProfile::builtin(language))
            .unwrap_or_else(|| RepoProfile {
                language: language.to_string(),
                ..RepoProfile::default()
            })
    }

    /// Comment and move the ticket. Failures are logged, never fatal.
    async fn feedback(&self, ticket_id: &str, text: &str, status: Option<TicketStatus>) {
        if let Err(e) = self.tickets.comment(ticket_id, text).await {
            tracing::warn!(ticket_id, error = %e, "Failed to comment on ticket");
        }
        if let Some(status) = status
            && let Err(e) = self.tickets.transition_status(ticket_id, status).await
        {
            tracing::warn!(ticket_id, error = %e, "Failed to update ticket status");
        }
    }

    /// Schema-validate a plan, then check it against policy.
    fn admit_plan(&self, stage: &str, plan: &Plan) -> Result<(Plan, PolicyCheckResult), WorkflowError> {
        let value = serde_json::to_value(plan).map_err(|e| stage_error(stage, e))?;
        let (plan, validation) = self
            .schema
            .validate_plan(&value)
            .map_err(|e| stage_error(stage, e))?;
        for warning in &validation.warnings {
            tracing::warn!(stage, warning, "Plan validation warning");
        }
        let compliance = self.policy.check_plan_compliance(&plan);
        reject_violations(stage, "Plan", &compliance)?;
        Ok((plan, compliance))
    }

    fn admit_patch(&self, stage: &str, patch: &Patch) -> Result<(Patch, PolicyCheckResult), WorkflowError> {
        let value = serde_json::to_value(patch).map_err(|e| stage_error(stage, e))?;
        let (patch, validation) = self
            .schema
            .validate_patch(&value)
            .map_err(|e| stage_error(stage, e))?;
        for warning in &validation.warnings {
            tracing::warn!(stage, warning, "Patch validation warning");
        }
        let compliance = self.policy.check_patch_compliance(&patch);
        reject_violations(stage, "Patch", &compliance)?;
        Ok((patch, compliance))
    }
}

fn stage_error(stage: &str, error: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::StageExecutionFailed {
        stage: stage.to_string(),
        message: error.to_string(),
    }
}

fn collaborator_error(stage: &str, error: anyhow::Error) -> WorkflowError {
    stage_error(stage, format!("{:#}", error))
}

fn executor_error(stage: &str, error: StageFailure) -> WorkflowError {
    stage_error(stage, error)
}

fn reject_violations(stage: &str, what: &str, compliance: &PolicyCheckResult) -> Result<(), WorkflowError> {
    if compliance.passed {
        return Ok(());
    }
    Err(stage_error(
        stage,
        format!("{} violates policy: {}", what, compliance.violations.join("; ")),
    ))
}

fn require<'a, T>(stage: &str, value: &'a Option<T>, what: &str) -> Result<&'a T, WorkflowError> {
    value
        .as_ref()
        .ok_or_else(|| stage_error(stage, format!("missing {} artifact", what)))
}

/// Lowercase dash-separated slug, at most `max_len` bytes.
fn slugify(text: &str, max_len: usize) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

fn branch_name(ticket: &Ticket) -> String {
    let title = slugify(&ticket.title, 40);
    if title.is_empty() {
        format!("shipwright/{}", slugify(&ticket.id, 40))
    } else {
        format!("shipwright/{}-{}", slugify(&ticket.id, 40), title)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// INGESTED: fetch the ticket, check out a branch and profile the repository.
struct BuildContext(Arc<StageDeps>);

#[async_trait]
impl StageHandler for BuildContext {
    fn name(&self) -> &'static str {
        "build_context"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let ticket = deps
            .tickets
            .fetch(&workflow.ticket_id)
            .await
            .map_err(|e| collaborator_error(stage, e))?;

        let workspace = deps
            .workspace_root
            .join(&workflow.id)
            .join(format!("attempt-{}", workflow.retries));
        deps.code_host
            .clone_repository(&ticket.repository, &workspace)
            .await
            .map_err(|e| collaborator_error(stage, e))?;
        let branch = branch_name(&ticket);
        deps.code_host
            .create_branch(&workspace, &branch)
            .await
            .map_err(|e| collaborator_error(stage, e))?;

        let language = detect_language(&workspace).to_string();
        let profile = deps.profile_for(&language);
        let files = match &deps.introspect {
            Some(executor) => {
                let request = SandboxRequest::new(&workspace, "git ls-files", &language);
                let result = executor.run_direct(&request).await;
                if result.succeeded() {
                    result.stdout.lines().map(str::to_string).collect()
                } else {
                    tracing::warn!(exit_code = result.exit_code, "Could not list repository files");
                    Vec::new()
                }
            }
            None => Vec::new(),
        };

        tracing::info!(
            workflow_id = %workflow.id,
            branch = %branch,
            language = %language,
            files = files.len(),
            "Context ready"
        );
        deps.feedback(
            &ticket.id,
            &format!("Automation started on branch `{}`.", branch),
            Some(TicketStatus::InProgress),
        )
        .await;

        let mut artifacts = workflow.artifacts.clone();
        artifacts.ticket = Some(ticket);
        artifacts.workspace = Some(workspace);
        artifacts.branch = Some(branch);
        artifacts.language = Some(language);
        artifacts.profile = Some(profile);
        artifacts.files = files;
        Ok(StageOutcome {
            next: WorkflowState::ContextReady,
            artifacts,
        })
    }
}

/// CONTEXT_READY: ask the planner for a plan and admit it.
struct PlanStage(Arc<StageDeps>);

#[async_trait]
impl StageHandler for PlanStage {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let a = &workflow.artifacts;
        let input = PlanningInput {
            ticket: require(stage, &a.ticket, "ticket")?.clone(),
            context: RepoContext {
                workspace: require(stage, &a.workspace, "workspace")?.clone(),
                branch: require(stage, &a.branch, "branch")?.clone(),
                language: a.language.clone().unwrap_or_else(|| "generic".to_string()),
                files: a.files.clone(),
            },
        };
        let plan = deps
            .planner
            .plan(&input)
            .await
            .map_err(|e| executor_error(stage, e))?;
        let (plan, compliance) = deps.admit_plan(stage, &plan)?;

        tracing::info!(
            workflow_id = %workflow.id,
            steps = plan.steps.len(),
            risk_score = compliance.risk_score,
            "Plan accepted"
        );
        let mut artifacts = a.clone();
        artifacts.plan = Some(plan);
        artifacts.plan_compliance = Some(compliance);
        Ok(StageOutcome {
            next: WorkflowState::Planned,
            artifacts,
        })
    }
}

/// PLANNED: announce the plan on the ticket.
struct BeginImplementation(Arc<StageDeps>);

#[async_trait]
impl StageHandler for BeginImplementation {
    fn name(&self) -> &'static str {
        "begin_implementation"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let stage = self.name();
        let plan = require(stage, &workflow.artifacts.plan, "plan")?;
        let mut text = format!("Plan: {}\n", plan.summary);
        for step in &plan.steps {
            text.push_str(&format!("- {}\n", step.description));
        }
        self.0.feedback(&workflow.ticket_id, &text, None).await;
        Ok(StageOutcome {
            next: WorkflowState::Implementing,
            artifacts: workflow.artifacts.clone(),
        })
    }
}

/// IMPLEMENTING: produce a patch, admit it and commit.
struct Implement(Arc<StageDeps>);

#[async_trait]
impl StageHandler for Implement {
    fn name(&self) -> &'static str {
        "implement"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let a = &workflow.artifacts;
        let ticket = require(stage, &a.ticket, "ticket")?;
        let plan = require(stage, &a.plan, "plan")?;
        let workspace = require(stage, &a.workspace, "workspace")?;

        let input = ImplementationInput {
            ticket: ticket.clone(),
            plan: plan.clone(),
            workspace: workspace.clone(),
        };
        let patch = deps
            .implementer
            .implement(&input)
            .await
            .map_err(|e| executor_error(stage, e))?;
        let (patch, compliance) = deps.admit_patch(stage, &patch)?;

        let message = format!("{}: {}", ticket.id, patch.summary);
        let commit = deps
            .code_host
            .commit_all(workspace, &message)
            .await
            .map_err(|e| collaborator_error(stage, e))?;
        tracing::info!(workflow_id = %workflow.id, commit = %commit, "Patch committed");

        let mut artifacts = a.clone();
        artifacts.patch = Some(patch);
        artifacts.patch_compliance = Some(compliance);
        artifacts.commits.push(commit);
        Ok(StageOutcome {
            next: WorkflowState::Testing,
            artifacts,
        })
    }
}

/// TESTING: run every required check through the check runner.
struct RunChecks(Arc<StageDeps>);

#[async_trait]
impl StageHandler for RunChecks {
    fn name(&self) -> &'static str {
        "run_checks"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let a = &workflow.artifacts;
        let workspace = require(stage, &a.workspace, "workspace")?;
        let language = a.language.clone().unwrap_or_else(|| "generic".to_string());
        let profile = a.profile.clone().unwrap_or_else(|| deps.profile_for(&language));

        let mut report = CheckReport::default();
        for check in deps.policy.required_checks() {
            let Some(command) = profile.check_command(&check.name) else {
                tracing::warn!(check = %check.name, language = %language, "No command for required check, skipping");
                report.outcomes.push(CheckOutcome {
                    name: check.name,
                    command: None,
                    passed: true,
                    exit_code: None,
                    timed_out: false,
                    output: "skipped: no command configured".to_string(),
                });
                continue;
            };

            let request = SandboxRequest::new(workspace, command, &language)
                .with_profile(profile.clone())
                .with_ticket(&workflow.ticket_id);
            let outcome = match deps.checks.run_check(&request).await {
                Ok(result) => CheckOutcome {
                    name: check.name,
                    command: Some(command.to_string()),
                    passed: result.succeeded(),
                    exit_code: Some(result.exit_code),
                    timed_out: result.timed_out,
                    output: tail(&result.combined_output(), CHECK_OUTPUT_TAIL),
                },
                Err(e) => CheckOutcome {
                    name: check.name,
                    command: Some(command.to_string()),
                    passed: false,
                    exit_code: None,
                    timed_out: false,
                    output: e.to_string(),
                },
            };
            tracing::info!(check = %outcome.name, passed = outcome.passed, "Check finished");
            report.outcomes.push(outcome);
        }

        let next = if report.all_passed() {
            WorkflowState::Reviewing
        } else {
            WorkflowState::Fixing
        };
        let mut artifacts = a.clone();
        artifacts.check_report = Some(report);
        Ok(StageOutcome { next, artifacts })
    }
}

/// REVIEWING: combine reviewer feedback with the policy summary; open the
/// pull request when both approve.
struct Review(Arc<StageDeps>);

#[async_trait]
impl StageHandler for Review {
    fn name(&self) -> &'static str {
        "review"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let a = &workflow.artifacts;
        let ticket = require(stage, &a.ticket, "ticket")?;
        let plan = require(stage, &a.plan, "plan")?;
        let patch = require(stage, &a.patch, "patch")?;
        let compliance = require(stage, &a.patch_compliance, "patch compliance")?;

        let feedback = deps
            .reviewer
            .review(&ReviewInput {
                ticket: ticket.clone(),
                plan: plan.clone(),
                patch: patch.clone(),
            })
            .await
            .map_err(|e| executor_error(stage, e))?;
        let summary = compliance.to_review_summary();
        let approved = feedback.approved && summary.status == ReviewStatus::Approved;

        let mut artifacts = a.clone();
        if !approved {
            tracing::info!(workflow_id = %workflow.id, "Review requested changes");
            let mut comments = feedback.comments;
            comments.extend(compliance.violations.iter().cloned());
            artifacts.review_comments = comments;
            artifacts.review = Some(summary);
            return Ok(StageOutcome {
                next: WorkflowState::Fixing,
                artifacts,
            });
        }

        let workspace = require(stage, &a.workspace, "workspace")?;
        let branch = require(stage, &a.branch, "branch")?;
        deps.code_host
            .push(workspace, branch)
            .await
            .map_err(|e| collaborator_error(stage, e))?;
        let url = deps
            .code_host
            .open_pull_request(&PullRequestRequest {
                workspace: workspace.clone(),
                branch: branch.clone(),
                base_branch: ticket.base_branch().to_string(),
                title: format!("{}: {}", ticket.id, ticket.title),
                body: format!("{}\n\n{}", plan.summary, summary.body),
            })
            .await
            .map_err(|e| collaborator_error(stage, e))?;

        tracing::info!(workflow_id = %workflow.id, url = %url, "Pull request opened");
        deps.feedback(
            &ticket.id,
            &format!("Pull request opened: {}", url),
            Some(TicketStatus::InReview),
        )
        .await;

        artifacts.review_comments.clear();
        artifacts.review = Some(summary);
        artifacts.pull_request_url = Some(url);
        Ok(StageOutcome {
            next: WorkflowState::PrCreated,
            artifacts,
        })
    }
}

/// FIXING: hand failed checks or review comments back to the implementer.
struct Fix(Arc<StageDeps>);

#[async_trait]
impl StageHandler for Fix {
    fn name(&self) -> &'static str {
        "fix"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let deps = &self.0;
        let stage = self.name();
        let a = &workflow.artifacts;
        let ticket = require(stage, &a.ticket, "ticket")?;
        let workspace = require(stage, &a.workspace, "workspace")?;

        let failures = match &a.check_report {
            Some(report) if !report.all_passed() => report.failures(),
            _ => a.review_comments.clone(),
        };
        let input = FixInput {
            ticket: ticket.clone(),
            plan: require(stage, &a.plan, "plan")?.clone(),
            patch: require(stage, &a.patch, "patch")?.clone(),
            workspace: workspace.clone(),
            failures,
        };
        let patch = deps
            .implementer
            .fix(&input)
            .await
            .map_err(|e| executor_error(stage, e))?;
        let (patch, compliance) = deps.admit_patch(stage, &patch)?;

        let commit = deps
            .code_host
            .commit_all(workspace, &format!("{}: fix {}", ticket.id, patch.summary))
            .await
            .map_err(|e| collaborator_error(stage, e))?;

        let mut artifacts = a.clone();
        artifacts.patch = Some(patch);
        artifacts.patch_compliance = Some(compliance);
        artifacts.commits.push(commit);
        artifacts.review_comments.clear();
        Ok(StageOutcome {
            next: WorkflowState::Testing,
            artifacts,
        })
    }
}

/// PR_CREATED: nothing left to do but record completion.
struct Complete;

#[async_trait]
impl StageHandler for Complete {
    fn name(&self) -> &'static str {
        "complete"
    }

    async fn run(&self, workflow: &Workflow) -> Result<StageOutcome, WorkflowError> {
        let url = workflow
            .artifacts
            .pull_request_url
            .as_deref()
            .unwrap_or("(unknown)");
        tracing::info!(workflow_id = %workflow.id, url, "Workflow complete");
        Ok(StageOutcome {
            next: WorkflowState::Done,
            artifacts: workflow.artifacts.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SandboxError;
    use crate::policy::{PolicyConfig, RiskLevel};
    use crate::sandbox::ProcessResult;
    use crate::workflow::{
        Dispatch, MemoryWorkflowStore, WorkflowConfig, WorkflowEvent, WorkflowMachine,
        WorkflowStatus, WorkflowStore,
    };
    use shipwright_common::{PatchFile, PlanStep, ReviewFeedback};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTickets {
        comments: Mutex<Vec<String>>,
        statuses: Mutex<Vec<TicketStatus>>,
    }

    #[async_trait]
    impl TicketSource for FakeTickets {
        async fn fetch(&self, ticket_id: &str) -> anyhow::Result<Ticket> {
            Ok(Ticket {
                id: ticket_id.to_string(),
                title: "Add pagination to orders".to_string(),
                description: "Orders endpoint returns everything".to_string(),
                labels: vec![],
                repository: "https://git.example/acme/shop.git".to_string(),
                base_branch: None,
            })
        }

        async fn comment(&self, _ticket_id: &str, text: &str) -> anyhow::Result<()> {
            self.comments.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn transition_status(&self, _ticket_id: &str, status: TicketStatus) -> anyhow::Result<()> {
            self.statuses.lock().unwrap().push(status);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeHost {
        pull_requests: Mutex<Vec<PullRequestRequest>>,
        commits: AtomicUsize,
    }

    #[async_trait]
    impl CodeHost for FakeHost {
        async fn clone_repository(&self, _repository: &str, destination: &Path) -> anyhow::Result<()> {
            std::fs::create_dir_all(destination)?;
            std::fs::write(destination.join("Cargo.toml"), "[package]\nname = \"shop\"\n")?;
            Ok(())
        }

        async fn create_branch(&self, _workspace: &Path, _branch: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn commit_all(&self, _workspace: &Path, _message: &str) -> anyhow::Result<String> {
            let n = self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(format!("c{}", n + 1))
        }

        async fn push(&self, _workspace: &Path, _branch: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn open_pull_request(&self, request: &PullRequestRequest) -> anyhow::Result<String> {
            self.pull_requests.lock().unwrap().push(request.clone());
            Ok("https://git.example/acme/shop/pull/7".to_string())
        }
    }

    struct FakePlanner {
        plan: Plan,
    }

    #[async_trait]
    impl Planner for FakePlanner {
        async fn plan(&self, _input: &PlanningInput) -> Result<Plan, StageFailure> {
            Ok(self.plan.clone())
        }
    }

    struct FakeImplementer {
        fixes: AtomicUsize,
    }

    fn small_patch(summary: &str) -> Patch {
        Patch {
            summary: summary.to_string(),
            files: vec![PatchFile {
                path: "src/orders.rs".to_string(),
                lines_added: 40,
                lines_removed: 5,
                change: Default::default(),
            }],
            test_coverage: Some(91.0),
            ..Patch::default()
        }
    }

    #[async_trait]
    impl Implementer for FakeImplementer {
        async fn implement(&self, _input: &ImplementationInput) -> Result<Patch, StageFailure> {
            Ok(small_patch("Paginate orders"))
        }

        async fn fix(&self, input: &FixInput) -> Result<Patch, StageFailure> {
            assert!(!input.failures.is_empty());
            self.fixes.fetch_add(1, Ordering::SeqCst);
            Ok(small_patch("Fix failing test"))
        }
    }

    struct FakeReviewer;

    #[async_trait]
    impl Reviewer for FakeReviewer {
        async fn review(&self, _input: &ReviewInput) -> Result<ReviewFeedback, StageFailure> {
            Ok(ReviewFeedback {
                approved: true,
                comments: vec![],
            })
        }
    }

    /// Fails every check for the first `failing_rounds` rounds.
    struct FakeChecks {
        runs: AtomicUsize,
        failing_runs: usize,
    }

    #[async_trait]
    impl CheckRunner for FakeChecks {
        async fn run_check(&self, _request: &SandboxRequest) -> Result<ProcessResult, SandboxError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            let exit_code = if n < self.failing_runs { 1 } else { 0 };
            Ok(ProcessResult {
                exit_code,
                stdout: if exit_code == 0 { "ok".into() } else { "test failed".into() },
                stderr: String::new(),
                duration_ms: 5,
                timed_out: false,
                truncated: false,
                timeout_secs: 300,
                log_paths: vec![],
            })
        }
    }

    fn good_plan() -> Plan {
        Plan {
            summary: "Cursor pagination for orders".to_string(),
            steps: vec![
                PlanStep {
                    id: "s1".to_string(),
                    description: "Add cursor parameter".to_string(),
                    files: vec!["src/orders.rs".to_string(), "src/api/orders.rs".to_string()],
                    depends_on: vec![],
                },
                PlanStep {
                    id: "s2".to_string(),
                    description: "Cover pagination edges".to_string(),
                    files: vec!["tests/orders.rs".to_string()],
                    depends_on: vec!["s1".to_string()],
                },
            ],
            estimated_lines_changed: 120,
            test_coverage: Some(88.0),
            ..Plan::default()
        }
    }

    struct Harness {
        machine: WorkflowMachine,
        tickets: Arc<FakeTickets>,
        host: Arc<FakeHost>,
        checks: Arc<FakeChecks>,
        _root: tempfile::TempDir,
    }

    fn harness(plan: Plan, failing_runs: usize, config: WorkflowConfig) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let tickets = Arc::new(FakeTickets::default());
        let host = Arc::new(FakeHost::default());
        let checks = Arc::new(FakeChecks {
            runs: AtomicUsize::new(0),
            failing_runs,
        });
        let deps = Arc::new(StageDeps {
            tickets: tickets.clone(),
            code_host: host.clone(),
            planner: Arc::new(FakePlanner { plan }),
            implementer: Arc::new(FakeImplementer {
                fixes: AtomicUsize::new(0),
            }),
            reviewer: Arc::new(FakeReviewer),
            checks: checks.clone(),
            introspect: None,
            schema: Arc::new(SchemaValidator::new()),
            policy: Arc::new(PolicyEnforcer::new(PolicyConfig::default()).unwrap()),
            profiles: vec![],
            workspace_root: root.path().to_path_buf(),
        });
        let machine = WorkflowMachine::new(
            config,
            Arc::new(MemoryWorkflowStore::new()),
            StageTable::pipeline(deps),
        )
        .with_tickets(tickets.clone())
        .with_dispatch(Dispatch::Spawn);
        Harness {
            machine,
            tickets,
            host,
            checks,
            _root: root,
        }
    }

    fn fast() -> WorkflowConfig {
        WorkflowConfig {
            dispatch_delay_ms: 0,
            ..WorkflowConfig::default()
        }
    }

    async fn wait_terminal(machine: &WorkflowMachine, id: &str) -> WorkflowStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = machine.status(id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "stuck in {}", status.state);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_happy_path_reaches_done() {
        let h = harness(good_plan(), 0, fast());
        let wf = h.machine.start("ACME-42").await.unwrap();
        let status = wait_terminal(&h.machine, &wf.id).await;

        assert_eq!(status.state, WorkflowState::Done);
        assert_eq!(status.retries, 0);
        assert_eq!(
            status.pull_request_url.as_deref(),
            Some("https://git.example/acme/shop/pull/7")
        );

        assert!(status.is_complete);
        assert_eq!(h.machine.list().await.unwrap().len(), 1);

        let requests = h.host.pull_requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].branch, "shipwright/acme-42-add-pagination-to-orders");
        assert_eq!(requests[0].base_branch, "main");
        assert!(requests[0].body.contains("Policy review: approved"));

        // Four quality checks plus two security scans, all from the rust profile.
        assert_eq!(h.checks.runs.load(Ordering::SeqCst), 6);
        let statuses = h.tickets.statuses.lock().unwrap().clone();
        assert_eq!(statuses, vec![TicketStatus::InProgress, TicketStatus::InReview]);
    }

    #[tokio::test]
    async fn test_happy_path_records_seven_transitions() {
        let store = Arc::new(MemoryWorkflowStore::new());
        let h = harness(good_plan(), 0, fast());
        // same pipeline, over a store the test can read back
        let machine = WorkflowMachine::new(fast(), store.clone(), h.machine.stages().clone());
        let wf = machine.start("ACME-7").await.unwrap();
        wait_terminal(&machine, &wf.id).await;

        let stored = store.get(&wf.id).await.unwrap().unwrap();
        let path: Vec<_> = stored.transitions().map(|(_, to)| to).collect();
        assert_eq!(
            path,
            vec![
                WorkflowState::ContextReady,
                WorkflowState::Planned,
                WorkflowState::Implementing,
                WorkflowState::Testing,
                WorkflowState::Reviewing,
                WorkflowState::PrCreated,
                WorkflowState::Done,
            ]
        );
        assert_eq!(stored.retries, 0);
        assert_eq!(stored.artifacts.language.as_deref(), Some("rust"));

        let plan = stored.artifacts.plan.as_ref().unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.referenced_files().len(), 3);
        let compliance = stored.artifacts.plan_compliance.as_ref().unwrap();
        assert!(compliance.passed);
        assert_eq!(compliance.risk_score, 0);
        assert_eq!(compliance.risk_level, RiskLevel::Low);
        assert!(compliance.risk_factors.is_empty());
        assert_eq!(stored.artifacts.commits, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_failing_checks_loop_through_fixing() {
        // First round of six checks fails, second passes.
        let h = harness(good_plan(), 6, fast());
        let wf = h.machine.start("ACME-9").await.unwrap();
        let status = wait_terminal(&h.machine, &wf.id).await;

        assert_eq!(status.state, WorkflowState::Done);
        assert_eq!(status.fix_loops, 1);
        assert_eq!(h.checks.runs.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_fix_loop_limit_fails_workflow() {
        let config = WorkflowConfig {
            max_fix_loops: 1,
            ..fast()
        };
        let h = harness(good_plan(), usize::MAX, config);
        let wf = h.machine.start("ACME-10").await.unwrap();
        let status = wait_terminal(&h.machine, &wf.id).await;

        assert_eq!(status.state, WorkflowState::Failed);
        assert!(!status.cancelled);
        assert!(status.last_error.unwrap().contains("Fix loop limit exceeded"));
        assert_eq!(
            h.tickets.statuses.lock().unwrap().last(),
            Some(&TicketStatus::Blocked)
        );
    }

    #[tokio::test]
    async fn test_non_compliant_plan_fails_in_plan_stage() {
        let mut plan = good_plan();
        plan.steps[0].files.push(".git/config".to_string());
        let h = harness(plan, 0, fast());
        let wf = h.machine.start("ACME-11").await.unwrap();
        let status = wait_terminal(&h.machine, &wf.id).await;

        assert_eq!(status.state, WorkflowState::Failed);
        let error = status.last_error.unwrap();
        assert!(error.starts_with("Stage plan failed: Plan violates policy"), "{}", error);
        assert!(
            h.tickets
                .comments
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("Automation failed during plan"))
        );
        assert_eq!(h.checks.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_workflow_stops_dispatching() {
        let config = WorkflowConfig {
            dispatch_delay_ms: 200,
            ..WorkflowConfig::default()
        };
        let h = harness(good_plan(), 0, config);
        let wf = h.machine.start("ACME-12").await.unwrap();
        let cancelled = h.machine.cancel(&wf.id).await.unwrap();
        assert!(matches!(cancelled.events.last(), Some(WorkflowEvent::Cancelled { .. })));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = h.machine.status(&wf.id).await.unwrap();
        assert_eq!(status.state, WorkflowState::Failed);
        assert!(status.cancelled);
        assert!(h.host.pull_requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_branch_name() {
        let ticket = Ticket {
            id: "PROJ-1".into(),
            title: "Fix: crash on empty cart!".into(),
            description: String::new(),
            labels: vec![],
            repository: "repo".into(),
            base_branch: None,
        };
        assert_eq!(branch_name(&ticket), "shipwright/proj-1-fix-crash-on-empty-cart");
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
