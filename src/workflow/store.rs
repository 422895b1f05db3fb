//! Workflow persistence with compare-and-set updates.
//!
//! Every mutation goes through `compare_and_swap`: the caller read the
//! workflow at `expected_version` and hands back the updated record; the
//! store rejects it if anything else was persisted in between.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::Mutex;

use super::model::Workflow;
use crate::errors::WorkflowError;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new workflow. Fails with `AlreadyExists` if its ticket
    /// already has one.
    async fn insert_new(&self, workflow: &Workflow) -> Result<(), WorkflowError>;

    async fn get(&self, id: &str) -> Result<Option<Workflow>, WorkflowError>;

    async fn find_by_ticket(&self, ticket_id: &str) -> Result<Option<Workflow>, WorkflowError>;

    /// Replace the stored record if it is still at `expected_version`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        workflow: &Workflow,
    ) -> Result<(), WorkflowError>;

    async fn list(&self) -> Result<Vec<Workflow>, WorkflowError>;
}

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert_new(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        let mut workflows = self.workflows.lock().await;
        if let Some(existing) = workflows
            .values()
            .find(|w| w.ticket_id == workflow.ticket_id)
        {
            return Err(WorkflowError::AlreadyExists {
                id: existing.id.clone(),
                state: existing.state,
            });
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Workflow>, WorkflowError> {
        Ok(self.workflows.lock().await.get(id).cloned())
    }

    async fn find_by_ticket(&self, ticket_id: &str) -> Result<Option<Workflow>, WorkflowError> {
        Ok(self
            .workflows
            .lock()
            .await
            .values()
            .find(|w| w.ticket_id == ticket_id)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        workflow: &Workflow,
    ) -> Result<(), WorkflowError> {
        let mut workflows = self.workflows.lock().await;
        let current = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| WorkflowError::NotFound {
                id: workflow.id.clone(),
            })?;
        if current.version != expected_version {
            return Err(WorkflowError::ConcurrentModification {
                id: workflow.id.clone(),
            });
        }
        *current = workflow.clone();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Workflow>, WorkflowError> {
        let mut all: Vec<Workflow> = self.workflows.lock().await.values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }
}

/// One JSON document per workflow in a directory.
///
/// Writers hold a process-local mutex and an exclusive lock on
/// `<dir>/.lock`, so several CLI invocations can share the directory.
#[derive(Debug)]
pub struct FileWorkflowStore {
    dir: PathBuf,
    local: Mutex<()>,
}

impl FileWorkflowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            local: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn locked<T, F>(&self, op: F) -> Result<T, WorkflowError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, WorkflowError> + Send + 'static,
    {
        let _local = self.local.lock().await;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let lock = acquire_dir_lock(&dir)?;
            let result = op(&dir);
            let _ = FileExt::unlock(&lock);
            result
        })
        .await
        .map_err(|e| WorkflowError::Store(anyhow!("Workflow store task failed: {}", e)))?
    }

    async fn read_only<T, F>(&self, op: F) -> Result<T, WorkflowError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, WorkflowError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || op(&dir))
            .await
            .map_err(|e| WorkflowError::Store(anyhow!("Workflow store task failed: {}", e)))?
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn insert_new(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        let workflow = workflow.clone();
        self.locked(move |dir| {
            if let Some(existing) = scan(dir)?
                .into_iter()
                .find(|w| w.ticket_id == workflow.ticket_id)
            {
                return Err(WorkflowError::AlreadyExists {
                    id: existing.id,
                    state: existing.state,
                });
            }
            write_atomic(dir, &workflow)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Workflow>, WorkflowError> {
        let id = id.to_string();
        self.read_only(move |dir| read_one(dir, &id)).await
    }

    async fn find_by_ticket(&self, ticket_id: &str) -> Result<Option<Workflow>, WorkflowError> {
        let ticket_id = ticket_id.to_string();
        self.read_only(move |dir| Ok(scan(dir)?.into_iter().find(|w| w.ticket_id == ticket_id)))
            .await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        workflow: &Workflow,
    ) -> Result<(), WorkflowError> {
        let workflow = workflow.clone();
        self.locked(move |dir| {
            let current = read_one(dir, &workflow.id)?.ok_or_else(|| WorkflowError::NotFound {
                id: workflow.id.clone(),
            })?;
            if current.version != expected_version {
                return Err(WorkflowError::ConcurrentModification {
                    id: workflow.id.clone(),
                });
            }
            write_atomic(dir, &workflow)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Workflow>, WorkflowError> {
        self.read_only(|dir| {
            let mut all = scan(dir)?;
            all.sort_by_key(|w| w.created_at);
            Ok(all)
        })
        .await
    }
}

fn store_err(e: anyhow::Error) -> WorkflowError {
    WorkflowError::Store(e)
}

fn acquire_dir_lock(dir: &Path) -> Result<File, WorkflowError> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))
        .map_err(store_err)?;
    let path = dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
        .map_err(store_err)?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))
        .map_err(store_err)?;
    Ok(file)
}

fn document_path(dir: &Path, id: &str) -> Result<PathBuf, WorkflowError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(WorkflowError::NotFound { id: id.to_string() });
    }
    Ok(dir.join(format!("{}.json", id)))
}

fn read_one(dir: &Path, id: &str) -> Result<Option<Workflow>, WorkflowError> {
    let path = document_path(dir, id)?;
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(store_err(
                anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
            ));
        }
    };
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
        .map(Some)
        .map_err(store_err)
}

fn scan(dir: &Path) -> Result<Vec<Workflow>, WorkflowError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(store_err(
                anyhow::Error::new(e).context(format!("Failed to list {}", dir.display())),
            ));
        }
    };

    let mut workflows = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str::<Workflow>(&c).map_err(anyhow::Error::from))
        {
            Ok(workflow) => workflows.push(workflow),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable workflow document"),
        }
    }
    Ok(workflows)
}

/// Write to a temp file in the same directory, then rename over the target.
fn write_atomic(dir: &Path, workflow: &Workflow) -> Result<(), WorkflowError> {
    let path = document_path(dir, &workflow.id)?;
    let tmp = dir.join(format!(".{}.json.tmp", workflow.id));
    let json = serde_json::to_vec_pretty(workflow)
        .context("Failed to serialize workflow")
        .map_err(store_err)?;

    let mut file = File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))
        .map_err(store_err)?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to write {}", tmp.display()))
        .map_err(store_err)?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to replace {}", path.display()))
        .map_err(store_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowState;

    async fn exercise(store: &dyn WorkflowStore) {
        let wf = Workflow::new("T-100");
        store.insert_new(&wf).await.unwrap();

        let dup = Workflow::new("T-100");
        match store.insert_new(&dup).await.unwrap_err() {
            WorkflowError::AlreadyExists { id, state } => {
                assert_eq!(id, wf.id);
                assert_eq!(state, WorkflowState::Ingested);
            }
            other => panic!("Expected AlreadyExists, got {:?}", other),
        }

        let mut updated = store.get(&wf.id).await.unwrap().unwrap();
        updated.state = WorkflowState::ContextReady;
        updated.version += 1;
        store.compare_and_swap(1, &updated).await.unwrap();

        // stale writer loses
        let mut stale = wf.clone();
        stale.state = WorkflowState::Failed;
        stale.version += 1;
        assert!(matches!(
            store.compare_and_swap(1, &stale).await.unwrap_err(),
            WorkflowError::ConcurrentModification { .. }
        ));

        let found = store.find_by_ticket("T-100").await.unwrap().unwrap();
        assert_eq!(found.state, WorkflowState::ContextReady);
        assert_eq!(found.version, 2);
        assert!(store.find_by_ticket("T-404").await.unwrap().is_none());
        assert!(store.get("missing").await.unwrap().is_none());

        store.insert_new(&Workflow::new("T-101")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryWorkflowStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path().join("workflows"));
        exercise(&store).await;

        let docs: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .collect();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let wf = Workflow::new("T-7");
        FileWorkflowStore::new(dir.path())
            .insert_new(&wf)
            .await
            .unwrap();

        let reopened = FileWorkflowStore::new(dir.path());
        assert_eq!(reopened.get(&wf.id).await.unwrap(), Some(wf));
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_cas_on_missing_workflow() {
        let store = MemoryWorkflowStore::new();
        let wf = Workflow::new("T-1");
        assert!(matches!(
            store.compare_and_swap(1, &wf).await.unwrap_err(),
            WorkflowError::NotFound { .. }
        ));
    }
}
