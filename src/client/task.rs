//! Task-status polling for long-running tool calls.
//!
//! When a `tools/call` reply carries `metadata.taskId`, the client keeps the
//! promise open and polls the task side-channel until the record reaches a
//! terminal state. Status changes are surfaced through an optional hook,
//! invoked exactly once per distinct status.

use crate::config::ENV_TASK_POLL_INTERVAL;
use crate::protocol::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Default wait between polls of the task side-channel.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Resolve the poll interval from `PLOINKY_MCP_TASK_POLL_INTERVAL_MS`.
/// Non-positive or unparsable values fall back to the default.
pub fn poll_interval_from_env() -> Duration {
    match env::var(ENV_TASK_POLL_INTERVAL) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                warn!(
                    value = %raw,
                    "ignoring invalid {ENV_TASK_POLL_INTERVAL}, using default"
                );
                Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
            }
        },
        Err(_) => Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
    }
}

/// Wire view of a task as served by the side-channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusBody {
    task: TaskSnapshot,
}

/// Callback invoked on every observed status change.
pub type StatusHook = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

/// Poll until the task settles. Network errors and transient HTTP errors are
/// retried on the next tick; only a terminal status (or a 404) ends the loop.
pub(crate) async fn poll_task(
    http: &reqwest::Client,
    task_url: &Url,
    bearer: Option<&str>,
    task_id: &str,
    interval: Duration,
    cancel: &CancellationToken,
    hook: Option<StatusHook>,
) -> Result<Value, McpError> {
    let mut last_status: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(McpError::closed()),
            _ = tokio::time::sleep(interval) => {}
        }

        let mut request = http.get(task_url.clone()).query(&[("taskId", task_id)]);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, task_id, "task poll network error, retrying");
                continue;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            let snapshot = TaskSnapshot {
                id: task_id.to_string(),
                tool_name: None,
                status: "failed".to_string(),
                created_at: None,
                updated_at: None,
                error: Some("task not found".to_string()),
                result: None,
            };
            if last_status.as_deref() != Some("failed")
                && let Some(hook) = hook.as_ref()
            {
                hook(&snapshot);
            }
            return Err(
                McpError::server_error("task not found").with_data(json!({"task": snapshot}))
            );
        }
        if !status.is_success() {
            warn!(%status, task_id, "task poll http error, retrying");
            continue;
        }

        let body: TaskStatusBody = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, task_id, "unreadable task status, retrying");
                continue;
            }
        };
        let task = body.task;

        if last_status.as_deref() != Some(task.status.as_str()) {
            last_status = Some(task.status.clone());
            if let Some(hook) = hook.as_ref() {
                hook(&task);
            }
        }

        match task.status.as_str() {
            "completed" => return Ok(merge_outcome(&task)),
            "failed" => {
                let message = task
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                return Err(McpError::server_error(message).with_data(json!({"task": task})));
            }
            _ => {}
        }
    }
}

/// Shape the resolved value of a completed task: the result's content plus
/// metadata enriched with the task's identity and timestamps.
fn merge_outcome(task: &TaskSnapshot) -> Value {
    let result = task.result.clone().unwrap_or_else(|| json!({}));
    let content = result.get("content").cloned().unwrap_or_else(|| json!([]));

    let mut metadata = match result.get("metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    metadata.insert("taskId".to_string(), json!(task.id));
    metadata.insert("status".to_string(), json!(task.status));
    if let Some(tool_name) = &task.tool_name {
        metadata.insert("toolName".to_string(), json!(tool_name));
    }
    if let Some(created_at) = &task.created_at {
        metadata.insert("createdAt".to_string(), created_at.clone());
    }
    if let Some(updated_at) = &task.updated_at {
        metadata.insert("updatedAt".to_string(), updated_at.clone());
    }

    json!({"content": content, "metadata": metadata})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_env_parsing() {
        unsafe {
            env::set_var(ENV_TASK_POLL_INTERVAL, "250");
        }
        assert_eq!(poll_interval_from_env(), Duration::from_millis(250));

        unsafe {
            env::set_var(ENV_TASK_POLL_INTERVAL, "0");
        }
        assert_eq!(
            poll_interval_from_env(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );

        unsafe {
            env::set_var(ENV_TASK_POLL_INTERVAL, "soon");
        }
        assert_eq!(
            poll_interval_from_env(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );

        unsafe {
            env::remove_var(ENV_TASK_POLL_INTERVAL);
        }
        assert_eq!(
            poll_interval_from_env(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn test_merge_outcome_enriches_metadata() {
        let task = TaskSnapshot {
            id: "ab12cd34ef56ab78".to_string(),
            tool_name: Some("run_simulation".to_string()),
            status: "completed".to_string(),
            created_at: Some(json!("2026-01-01T00:00:00Z")),
            updated_at: Some(json!("2026-01-01T00:00:05Z")),
            error: None,
            result: Some(json!({
                "content": [{"type": "text", "text": "done"}],
                "metadata": {"steps": 3}
            })),
        };

        let merged = merge_outcome(&task);
        assert_eq!(merged["content"][0]["text"], json!("done"));
        assert_eq!(merged["metadata"]["steps"], json!(3));
        assert_eq!(merged["metadata"]["taskId"], json!("ab12cd34ef56ab78"));
        assert_eq!(merged["metadata"]["status"], json!("completed"));
        assert_eq!(merged["metadata"]["toolName"], json!("run_simulation"));
        assert_eq!(merged["metadata"]["createdAt"], json!("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_merge_outcome_with_bare_result() {
        let task = TaskSnapshot {
            id: "x".to_string(),
            tool_name: None,
            status: "completed".to_string(),
            created_at: None,
            updated_at: None,
            error: None,
            result: None,
        };

        let merged = merge_outcome(&task);
        assert_eq!(merged["content"], json!([]));
        assert_eq!(merged["metadata"]["taskId"], json!("x"));
    }
}
