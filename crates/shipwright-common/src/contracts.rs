//! Collaborator contracts consumed by the workflow engine.
//!
//! Implementations live outside this workspace (ticket system adapters,
//! code host adapters, AI services). The engine only depends on these
//! narrow traits, so tests can substitute in-memory doubles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::payload::{Patch, Plan, RepoContext};
use crate::ticket::{Ticket, TicketStatus};

/// Failure reported by an AI stage executor.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("Stage failed: {0}")]
    StageFailed(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch(&self, ticket_id: &str) -> anyhow::Result<Ticket>;

    async fn comment(&self, ticket_id: &str, text: &str) -> anyhow::Result<()>;

    async fn transition_status(&self, ticket_id: &str, status: TicketStatus)
    -> anyhow::Result<()>;
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRequest {
    pub workspace: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn clone_repository(&self, repository: &str, destination: &Path) -> anyhow::Result<()>;

    async fn create_branch(&self, workspace: &Path, branch: &str) -> anyhow::Result<()>;

    /// Commit every pending change. Returns the commit id.
    async fn commit_all(&self, workspace: &Path, message: &str) -> anyhow::Result<String>;

    async fn push(&self, workspace: &Path, branch: &str) -> anyhow::Result<()>;

    /// Open a pull request. Returns its URL.
    async fn open_pull_request(&self, request: &PullRequestRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningInput {
    pub ticket: Ticket,
    pub context: RepoContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationInput {
    pub ticket: Ticket,
    pub plan: Plan,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixInput {
    pub ticket: Ticket,
    pub plan: Plan,
    pub patch: Patch,
    pub workspace: PathBuf,
    /// Failed checks or review comments the fix must address.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInput {
    pub ticket: Ticket,
    pub plan: Plan,
    pub patch: Patch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub approved: bool,
    #[serde(default)]
    pub comments: Vec<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &PlanningInput) -> Result<Plan, StageFailure>;
}

#[async_trait]
pub trait Implementer: Send + Sync {
    async fn implement(&self, input: &ImplementationInput) -> Result<Patch, StageFailure>;

    async fn fix(&self, input: &FixInput) -> Result<Patch, StageFailure>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, input: &ReviewInput) -> Result<ReviewFeedback, StageFailure>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn get(&self, path: &str) -> anyhow::Result<Vec<u8>>;
}

/// In-process object store, used when no durable storage is configured.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.objects.write().await.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Object not found: {}", path))
    }
}
