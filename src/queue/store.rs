//! Durable snapshot persistence for the task queue.
//!
//! The full task set is serialized after every state transition. Writes go
//! to a sibling temp file and are renamed into place so a crash mid-write
//! never truncates the previous snapshot.

use super::Task;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

pub struct TaskStore {
    path: PathBuf,
    // Snapshot writes are single-writer.
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last snapshot. A missing file is an empty queue; an
    /// unreadable snapshot is logged and treated as empty rather than
    /// blocking startup.
    pub async fn load(&self) -> Result<Vec<Task>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {:?}", self.path));
            }
        };

        match serde_json::from_str::<Vec<Task>>(&raw) {
            Ok(tasks) => Ok(tasks),
            Err(err) => {
                warn!(path = ?self.path, %err, "discarding unreadable task snapshot");
                Ok(Vec::new())
            }
        }
    }

    /// Atomically replace the snapshot with the given task set.
    pub async fn save(&self, tasks: &[Task]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent:?}"))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(tasks)?;
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {tmp:?}"))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to move snapshot into {:?}", self.path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandSpec;
    use crate::queue::{Task, TaskStatus};
    use crate::types::{TaskId, ToolName};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_task(id: &str, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(id),
            tool_name: ToolName::new("echo_script"),
            command_spec: CommandSpec::shell("printf hi"),
            payload: json!({}),
            status,
            created_at: now,
            updated_at: now,
            error: None,
            result: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("demo.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_is_identity() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path().join("nested").join("demo.json"));

        let tasks = vec![
            sample_task("aaaaaaaaaaaaaaaa", TaskStatus::Pending),
            sample_task("bbbbbbbbbbbbbbbb", TaskStatus::Completed),
        ];
        store.save(&tasks).await.unwrap();

        let restored = store.load().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id.as_str(), "aaaaaaaaaaaaaaaa");
        assert_eq!(restored[0].status, TaskStatus::Pending);
        assert_eq!(restored[1].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        let store = TaskStore::new(&path);
        store.save(&[sample_task("cccccccccccccccc", TaskStatus::Pending)]).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = TaskStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
    }
}
