//! Full-output archiving to an object store.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use shipwright_common::ObjectStore;

/// Object store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid object key: {}", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("Failed to read {}", target.display()))
    }
}

/// Keys for one invocation's archived streams.
pub fn log_keys(ticket_id: Option<&str>, invocation_id: &str) -> (String, String) {
    let scope = ticket_id.unwrap_or("adhoc");
    (
        format!("sandbox/{}/{}/stdout.log", scope, invocation_id),
        format!("sandbox/{}/{}/stderr.log", scope, invocation_id),
    )
}

/// Store both streams and return their keys.
pub async fn archive_output(
    store: &dyn ObjectStore,
    ticket_id: Option<&str>,
    invocation_id: &str,
    stdout: &str,
    stderr: &str,
) -> Result<Vec<String>> {
    let (stdout_key, stderr_key) = log_keys(ticket_id, invocation_id);
    store.put(&stdout_key, stdout.as_bytes().to_vec()).await?;
    store.put(&stderr_key, stderr.as_bytes().to_vec()).await?;
    Ok(vec![stdout_key, stderr_key])
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::MemoryObjectStore;

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("a/b/c.log", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b/c.log").await.unwrap(), b"hello");
        assert!(dir.path().join("a/b/c.log").exists());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("../escape.log", Vec::new()).await.is_err());
        assert!(store.put("/abs.log", Vec::new()).await.is_err());
        assert!(store.get("a/../../b").await.is_err());
    }

    #[tokio::test]
    async fn test_archive_output_keys() {
        let store = MemoryObjectStore::new();
        let keys = archive_output(&store, Some("T-9"), "inv-1", "out", "err")
            .await
            .unwrap();
        assert_eq!(
            keys,
            vec!["sandbox/T-9/inv-1/stdout.log", "sandbox/T-9/inv-1/stderr.log"]
        );
        assert_eq!(store.get(&keys[1]).await.unwrap(), b"err");
    }
}
