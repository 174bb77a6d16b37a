//! Task execution engine.
//!
//! The queue never decides how work runs; it is handed a [`TaskExecutor`]
//! capability. The executor reports the spawned child's pid through the
//! `on_spawn` hook so the queue can deliver SIGKILL when a task overruns its
//! deadline.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// How to run one tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell command line, run via `sh -c`.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "timeoutMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_ms: Option<u64>,
}

impl CommandSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Callback invoked with the child's pid as soon as it is spawned.
pub type OnSpawn<'a> = &'a (dyn Fn(u32) + Send + Sync);

/// Capability injected into the task queue.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CommandSpec,
        payload: &Value,
        on_spawn: OnSpawn<'_>,
    ) -> Result<ExecutionOutput>;
}

/// Executor that spawns the command spec as a local `sh -c` child.
///
/// The tool payload is surfaced to the command through the environment:
/// `PLOINKY_PAYLOAD` carries the full JSON, and each top-level object field
/// `k` is exported as `PLOINKY_ARG_<K>` (strings raw, other values JSON).
#[derive(Debug, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        payload: &Value,
        on_spawn: OnSpawn<'_>,
    ) -> Result<ExecutionOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        for (k, v) in payload_env(payload) {
            cmd.env(k, v);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.command))?;

        if let Some(pid) = child.id() {
            debug!(pid, command = %spec.command, "spawned task child");
            on_spawn(pid);
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to collect child output")?;

        Ok(ExecutionOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn payload_env(payload: &Value) -> Vec<(String, String)> {
    let mut vars = vec![("PLOINKY_PAYLOAD".to_string(), payload.to_string())];

    if let Value::Object(map) = payload {
        for (key, value) in map {
            let name = format!(
                "PLOINKY_ARG_{}",
                key.chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                    .collect::<String>()
            );
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.push((name, rendered));
        }
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_spawn_hook() -> impl Fn(u32) + Send + Sync {
        |_pid| {}
    }

    #[tokio::test]
    async fn test_command_executor_captures_stdout() {
        let executor = CommandExecutor::new();
        let spec = CommandSpec::shell("printf hello");
        let hook = no_spawn_hook();

        let out = executor.execute(&spec, &json!({}), &hook).await.unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn test_command_executor_exposes_payload_args() {
        let executor = CommandExecutor::new();
        let spec = CommandSpec::shell("printf '%s' \"$PLOINKY_ARG_TEXT\"");
        let hook = no_spawn_hook();

        let out = executor
            .execute(&spec, &json!({"text": "hi"}), &hook)
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi");
    }

    #[tokio::test]
    async fn test_command_executor_reports_exit_code_and_stderr() {
        let executor = CommandExecutor::new();
        let spec = CommandSpec::shell("echo boom >&2; exit 3");
        let hook = no_spawn_hook();

        let out = executor.execute(&spec, &json!({}), &hook).await.unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_command_executor_reports_pid() {
        let executor = CommandExecutor::new();
        let spec = CommandSpec::shell("true");
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen_clone = seen.clone();
        let hook = move |pid: u32| {
            seen_clone.store(pid, std::sync::atomic::Ordering::SeqCst);
        };

        executor.execute(&spec, &json!({}), &hook).await.unwrap();
        assert_ne!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_payload_env_shapes() {
        let vars = payload_env(&json!({"text": "hi", "count": 2}));
        let map: std::collections::HashMap<_, _> = vars.into_iter().collect();
        assert_eq!(map.get("PLOINKY_ARG_TEXT").unwrap(), "hi");
        assert_eq!(map.get("PLOINKY_ARG_COUNT").unwrap(), "2");
        assert!(map.get("PLOINKY_PAYLOAD").unwrap().contains("\"text\""));
    }

    #[test]
    fn test_command_spec_serde_uses_camel_case_timeout() {
        let spec = CommandSpec::shell("true").with_timeout_ms(250);
        let wire = serde_json::to_value(&spec).unwrap();
        assert_eq!(wire["timeoutMs"], json!(250));
    }
}
