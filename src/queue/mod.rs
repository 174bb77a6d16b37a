//! Bounded-concurrency, disk-persistent task queue.
//!
//! Each agent runtime owns one queue. Tool invocations that opt into
//! deferred execution are enqueued here, run through the injected
//! [`TaskExecutor`] capability, and polled by callers over the task
//! side-channel. The full task set is persisted after every state
//! transition; on restart, records stuck in `running` are rewritten to
//! `pending` (at-least-once semantics).

mod store;

pub use store::TaskStore;

use crate::executor::{CommandSpec, ExecutionOutput, TaskExecutor};
use crate::types::{TaskId, ToolName};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle of a queued task. `Completed` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// Snapshots written by older builds may carry statuses this build does not
// know; they are read as `pending` so restore re-enqueues them.
impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        })
    }
}

/// Durable record of one deferred tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub tool_name: ToolName,
    pub command_spec: CommandSpec,
    #[serde(default)]
    pub payload: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Task {
    /// Wire view served on the task side-channel (command spec and payload
    /// stay private to the runtime).
    pub fn status_view(&self) -> Value {
        json!({
            "id": self.id,
            "toolName": self.tool_name,
            "status": self.status,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "error": self.error,
            "result": self.result,
        })
    }
}

/// Parameters for [`TaskQueue::enqueue_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tool_name: ToolName,
    pub command_spec: CommandSpec,
    pub payload: Value,
    pub timeout_ms: Option<u64>,
}

impl NewTask {
    pub fn new(tool_name: impl Into<ToolName>, command_spec: CommandSpec, payload: Value) -> Self {
        let timeout_ms = command_spec.timeout_ms;
        Self {
            tool_name: tool_name.into(),
            command_spec,
            payload,
            timeout_ms,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Receipt returned from enqueueing, after the record hit disk.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub id: TaskId,
    pub status: TaskStatus,
}

struct QueueState {
    tasks: HashMap<TaskId, Task>,
    pending: VecDeque<TaskId>,
    running: HashSet<TaskId>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    store: TaskStore,
    executor: Arc<dyn TaskExecutor>,
    max_concurrent: usize,
    wake: Notify,
    started: AtomicBool,
}

/// Handle to one agent's durable queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        snapshot_path: impl Into<PathBuf>,
        executor: Arc<dyn TaskExecutor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    pending: VecDeque::new(),
                    running: HashSet::new(),
                }),
                store: TaskStore::new(snapshot_path),
                executor,
                max_concurrent,
                wake: Notify::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Restore the snapshot, re-enqueue interrupted work and start the
    /// scheduler. Idempotent: repeated calls after the first are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut restored = self.inner.store.load().await?;
        restored.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        {
            let mut state = self.inner.state.lock().await;
            for mut task in restored {
                if task.status == TaskStatus::Running {
                    debug!(id = %task.id, "re-enqueueing task interrupted by restart");
                    task.status = TaskStatus::Pending;
                    task.updated_at = Utc::now();
                }
                if task.status == TaskStatus::Pending {
                    state.pending.push_back(task.id.clone());
                }
                state.tasks.insert(task.id.clone(), task);
            }
            self.inner.store.save(&ordered_snapshot(&state)).await?;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            scheduler_loop(inner).await;
        });

        Ok(())
    }

    /// Record a new task. The record is persisted before this returns.
    pub async fn enqueue_task(&self, new: NewTask) -> Result<EnqueueReceipt> {
        let receipt = {
            let mut state = self.inner.state.lock().await;
            let id = generate_task_id(&state.tasks);
            let now = Utc::now();
            let task = Task {
                id: id.clone(),
                tool_name: new.tool_name,
                command_spec: new.command_spec,
                payload: new.payload,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
                error: None,
                result: None,
                timeout_ms: new.timeout_ms,
            };
            state.tasks.insert(id.clone(), task);
            state.pending.push_back(id.clone());
            self.inner.store.save(&ordered_snapshot(&state)).await?;
            EnqueueReceipt {
                id,
                status: TaskStatus::Pending,
            }
        };

        self.inner.wake.notify_one();
        Ok(receipt)
    }

    /// Immutable snapshot of one task.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(id).cloned()
    }

    /// Number of records currently held (any status).
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn scheduler_loop(inner: Arc<QueueInner>) {
    loop {
        while dispatch_next(&inner).await {}
        inner.wake.notified().await;
    }
}

/// Pop one pending task into `running` (persisting the transition) and spawn
/// its execution. Returns false when no slot or no work is available.
async fn dispatch_next(inner: &Arc<QueueInner>) -> bool {
    let job = {
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        if state.running.len() >= inner.max_concurrent {
            None
        } else {
            loop {
                let Some(id) = state.pending.pop_front() else {
                    break None;
                };
                let job = match state.tasks.get_mut(&id) {
                    Some(task) if task.status == TaskStatus::Pending => {
                        task.status = TaskStatus::Running;
                        task.updated_at = Utc::now();
                        (task.command_spec.clone(), task.payload.clone(), task.timeout_ms)
                    }
                    _ => continue,
                };
                state.running.insert(id.clone());
                if let Err(err) = inner.store.save(&ordered_snapshot(state)).await {
                    warn!(%err, "failed to persist task transition to running");
                }
                break Some((id, job.0, job.1, job.2));
            }
        }
    };

    match job {
        Some((id, spec, payload, timeout_ms)) => {
            let inner = inner.clone();
            tokio::spawn(async move {
                run_one(inner, id, spec, payload, timeout_ms).await;
            });
            true
        }
        None => false,
    }
}

enum Verdict {
    Completed(ExecutionOutput),
    CommandFailed(ExecutionOutput),
    TimedOut(u64),
    Thrown(String),
}

async fn run_one(
    inner: Arc<QueueInner>,
    id: TaskId,
    spec: CommandSpec,
    payload: Value,
    timeout_ms: Option<u64>,
) {
    let pid_slot: Arc<std::sync::Mutex<Option<u32>>> = Arc::new(std::sync::Mutex::new(None));
    let slot = pid_slot.clone();
    let on_spawn = move |pid: u32| {
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(pid);
        }
    };

    let work = inner.executor.execute(&spec, &payload, &on_spawn);
    let verdict = match timeout_ms {
        // A zero or absent deadline arms no timer.
        Some(ms) if ms > 0 => match tokio::time::timeout(Duration::from_millis(ms), work).await {
            Ok(Ok(out)) => classify(out),
            Ok(Err(err)) => Verdict::Thrown(err.to_string()),
            Err(_) => {
                let pid = pid_slot.lock().ok().and_then(|g| *g);
                if let Some(pid) = pid {
                    kill_child(pid);
                }
                Verdict::TimedOut(ms)
            }
        },
        _ => match work.await {
            Ok(out) => classify(out),
            Err(err) => Verdict::Thrown(err.to_string()),
        },
    };

    let mut state = inner.state.lock().await;
    if let Some(task) = state.tasks.get_mut(&id) {
        let now = Utc::now();
        match verdict {
            Verdict::Completed(out) => {
                task.status = TaskStatus::Completed;
                task.result = Some(shape_success(&out));
                task.error = None;
            }
            Verdict::CommandFailed(out) => {
                task.status = TaskStatus::Failed;
                task.error = Some(if out.stderr.is_empty() {
                    format!("exit {}", out.code)
                } else {
                    out.stderr.clone()
                });
                task.result = Some(json!({"stdout": out.stdout, "stderr": out.stderr}));
            }
            Verdict::TimedOut(ms) => {
                task.status = TaskStatus::Failed;
                task.error = Some(format!("Task timed out after {ms}ms"));
                task.result = None;
            }
            Verdict::Thrown(msg) => {
                task.status = TaskStatus::Failed;
                task.error = Some(msg);
                task.result = None;
            }
        }
        task.updated_at = now;
    }
    state.running.remove(&id);
    if let Err(err) = inner.store.save(&ordered_snapshot(&state)).await {
        warn!(%err, "failed to persist terminal task state");
    }
    drop(state);

    inner.wake.notify_one();
}

fn classify(out: ExecutionOutput) -> Verdict {
    if out.code == 0 {
        Verdict::Completed(out)
    } else {
        Verdict::CommandFailed(out)
    }
}

fn shape_success(out: &ExecutionOutput) -> Value {
    let text = if out.stdout.is_empty() {
        "(no output)".to_string()
    } else {
        out.stdout.clone()
    };
    let mut content = vec![json!({"type": "text", "text": text})];
    if !out.stderr.is_empty() {
        content.push(json!({"type": "text", "text": format!("stderr:\n{}", out.stderr)}));
    }
    json!({"content": content})
}

fn kill_child(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, %err, "failed to deliver SIGKILL to timed-out task");
    } else {
        debug!(pid, "killed timed-out task child");
    }
}

/// Snapshot tasks in creation order for a stable on-disk layout.
fn ordered_snapshot(state: &QueueState) -> Vec<Task> {
    let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
    tasks.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
    tasks
}

/// 8 random bytes, hex encoded, re-drawn on the (unlikely) collision.
fn generate_task_id(existing: &HashMap<TaskId, Task>) -> TaskId {
    loop {
        let bytes = *Uuid::new_v4().as_bytes();
        let id: String = bytes[..8].iter().map(|b| format!("{b:02x}")).collect();
        let id = TaskId::new(id);
        if !existing.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandExecutor, OnSpawn};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Executor that records which tools ran and answers instantly.
    struct RecordingExecutor {
        calls: std::sync::Mutex<Vec<String>>,
        fail_with: Option<String>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_with: Some(message.to_string()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(
            &self,
            spec: &CommandSpec,
            _payload: &Value,
            _on_spawn: OnSpawn<'_>,
        ) -> Result<ExecutionOutput> {
            self.calls.lock().unwrap().push(spec.command.clone());
            if let Some(msg) = &self.fail_with {
                anyhow::bail!("{msg}");
            }
            Ok(ExecutionOutput {
                code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
            })
        }
    }

    /// Executor that parks until released, for concurrency assertions.
    struct GatedExecutor {
        gate: Arc<Notify>,
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor for GatedExecutor {
        async fn execute(
            &self,
            _spec: &CommandSpec,
            _payload: &Value,
            _on_spawn: OnSpawn<'_>,
        ) -> Result<ExecutionOutput> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(ExecutionOutput {
                code: 0,
                stdout: "done".to_string(),
                stderr: String::new(),
            })
        }
    }

    async fn wait_for_terminal(queue: &TaskQueue, id: &str) -> Task {
        for _ in 0..200 {
            if let Some(task) = queue.get_task(id).await
                && task.status.is_terminal()
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    fn snapshot_on_disk(path: &std::path::Path) -> Vec<Task> {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn stored_task(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "toolName": "run_simulation",
            "commandSpec": {"command": "printf done"},
            "payload": {},
            "status": status,
            "createdAt": Utc::now(),
            "updatedAt": Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_return() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        let queue = TaskQueue::new(&path, Arc::new(RecordingExecutor::new()), 0);
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new(
                "run_simulation",
                CommandSpec::shell("printf done"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(receipt.status, TaskStatus::Pending);

        let on_disk = snapshot_on_disk(&path);
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].id, receipt.id);
        assert_eq!(on_disk[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_zero_concurrency_never_runs() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::new());
        let queue = TaskQueue::new(dir.path().join("demo.json"), executor.clone(), 0);
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new(
                "run_simulation",
                CommandSpec::shell("printf done"),
                json!({}),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let task = queue.get_task(receipt.id.as_str()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restore_normalizes_running_to_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!([
                stored_task("aaaaaaaaaaaaaaaa", "running"),
                stored_task("bbbbbbbbbbbbbbbb", "pending"),
                stored_task("cccccccccccccccc", "completed"),
            ]))
            .unwrap(),
        )
        .unwrap();

        // Zero workers: restore happens but nothing is picked up, so the
        // normalized snapshot is observable.
        let queue = TaskQueue::new(&path, Arc::new(RecordingExecutor::new()), 0);
        queue.initialize().await.unwrap();

        let on_disk = snapshot_on_disk(&path);
        let statuses: HashMap<String, TaskStatus> = on_disk
            .iter()
            .map(|t| (t.id.as_str().to_string(), t.status))
            .collect();
        assert_eq!(statuses["aaaaaaaaaaaaaaaa"], TaskStatus::Pending);
        assert_eq!(statuses["bbbbbbbbbbbbbbbb"], TaskStatus::Pending);
        assert_eq!(statuses["cccccccccccccccc"], TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_restore_resumes_interrupted_work_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!([
                stored_task("aaaaaaaaaaaaaaaa", "running"),
                stored_task("bbbbbbbbbbbbbbbb", "pending"),
                stored_task("cccccccccccccccc", "completed"),
            ]))
            .unwrap(),
        )
        .unwrap();

        let executor = Arc::new(RecordingExecutor::new());
        let queue = TaskQueue::new(&path, executor.clone(), 2);
        queue.initialize().await.unwrap();

        let a = wait_for_terminal(&queue, "aaaaaaaaaaaaaaaa").await;
        let b = wait_for_terminal(&queue, "bbbbbbbbbbbbbbbb").await;
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(b.status, TaskStatus::Completed);

        // The completed record was not re-executed.
        assert_eq!(executor.calls().len(), 2);
        let c = queue.get_task("cccccccccccccccc").await.unwrap();
        assert_eq!(c.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_status_reads_as_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!([stored_task("dddddddddddddddd", "paused")])).unwrap(),
        )
        .unwrap();

        let queue = TaskQueue::new(&path, Arc::new(RecordingExecutor::new()), 0);
        queue.initialize().await.unwrap();

        let task = queue.get_task("dddddddddddddddd").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_completed_task_shapes_output() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(CommandExecutor::new()),
            1,
        );
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new(
                "echo_script",
                CommandSpec::shell("printf done; echo warn >&2"),
                json!({}),
            ))
            .await
            .unwrap();

        let task = wait_for_terminal(&queue, receipt.id.as_str()).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());

        let content = &task.result.as_ref().unwrap()["content"];
        assert_eq!(content[0]["text"], json!("done"));
        assert_eq!(content[1]["text"], json!("stderr:\nwarn\n"));
    }

    #[tokio::test]
    async fn test_empty_stdout_becomes_placeholder() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(CommandExecutor::new()),
            1,
        );
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new("noop", CommandSpec::shell("true"), json!({})))
            .await
            .unwrap();

        let task = wait_for_terminal(&queue, receipt.id.as_str()).await;
        let content = &task.result.as_ref().unwrap()["content"];
        assert_eq!(content[0]["text"], json!("(no output)"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr_or_code() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(CommandExecutor::new()),
            1,
        );
        queue.initialize().await.unwrap();

        let silent = queue
            .enqueue_task(NewTask::new("silent", CommandSpec::shell("exit 5"), json!({})))
            .await
            .unwrap();
        let task = wait_for_terminal(&queue, silent.id.as_str()).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("exit 5"));
        assert_eq!(task.result.as_ref().unwrap()["stderr"], json!(""));

        let noisy = queue
            .enqueue_task(NewTask::new(
                "noisy",
                CommandSpec::shell("echo broken >&2; exit 1"),
                json!({}),
            ))
            .await
            .unwrap();
        let task = wait_for_terminal(&queue, noisy.id.as_str()).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("broken\n"));
    }

    #[tokio::test]
    async fn test_executor_error_fails_task() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(RecordingExecutor::failing("no such container")),
            1,
        );
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new(
                "run_simulation",
                CommandSpec::shell("whatever"),
                json!({}),
            ))
            .await
            .unwrap();

        let task = wait_for_terminal(&queue, receipt.id.as_str()).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("no such container"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_fails() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(CommandExecutor::new()),
            1,
        );
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(
                NewTask::new("sleeper", CommandSpec::shell("sleep 10"), json!({}))
                    .with_timeout_ms(100),
            )
            .await
            .unwrap();

        let task = wait_for_terminal(&queue, receipt.id.as_str()).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(
            task.error
                .as_deref()
                .unwrap()
                .starts_with("Task timed out after 100ms")
        );
    }

    #[tokio::test]
    async fn test_concurrency_cap_holds() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::new(
            dir.path().join("demo.json"),
            Arc::new(GatedExecutor {
                gate: gate.clone(),
                started: started.clone(),
            }),
            1,
        );
        queue.initialize().await.unwrap();

        let first = queue
            .enqueue_task(NewTask::new("one", CommandSpec::shell("x"), json!({})))
            .await
            .unwrap();
        let second = queue
            .enqueue_task(NewTask::new("two", CommandSpec::shell("y"), json!({})))
            .await
            .unwrap();

        // Wait until the single worker slot is taken.
        for _ in 0..100 {
            if started.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
        let waiting = queue.get_task(second.id.as_str()).await.unwrap();
        assert_eq!(waiting.status, TaskStatus::Pending);

        // Release the workers; keep signalling until both drain.
        for _ in 0..200 {
            gate.notify_waiters();
            let second_state = queue.get_task(second.id.as_str()).await.unwrap();
            if second_state.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let done = wait_for_terminal(&queue, first.id.as_str()).await;
        assert_eq!(done.status, TaskStatus::Completed);
        let done = wait_for_terminal(&queue, second.id.as_str()).await;
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_ids_unique_across_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.json");

        let mut ids = HashSet::new();
        {
            let queue = TaskQueue::new(&path, Arc::new(RecordingExecutor::new()), 0);
            queue.initialize().await.unwrap();
            for _ in 0..4 {
                let receipt = queue
                    .enqueue_task(NewTask::new("a", CommandSpec::shell("true"), json!({})))
                    .await
                    .unwrap();
                assert!(ids.insert(receipt.id.clone()));
                assert_eq!(receipt.id.as_str().len(), 16);
            }
        }

        let queue = TaskQueue::new(&path, Arc::new(RecordingExecutor::new()), 0);
        queue.initialize().await.unwrap();
        for _ in 0..4 {
            let receipt = queue
                .enqueue_task(NewTask::new("b", CommandSpec::shell("true"), json!({})))
                .await
                .unwrap();
            assert!(ids.insert(receipt.id.clone()));
        }
        assert_eq!(queue.len().await, 8);
    }

    #[tokio::test]
    async fn test_status_view_hides_command_spec() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new(dir.path().join("demo.json"), Arc::new(RecordingExecutor::new()), 0);
        queue.initialize().await.unwrap();

        let receipt = queue
            .enqueue_task(NewTask::new(
                "run_simulation",
                CommandSpec::shell("secret-command"),
                json!({}),
            ))
            .await
            .unwrap();

        let view = queue
            .get_task(receipt.id.as_str())
            .await
            .unwrap()
            .status_view();
        assert_eq!(view["id"], json!(receipt.id.as_str()));
        assert_eq!(view["status"], json!("pending"));
        assert!(view.get("commandSpec").is_none());
        assert!(!view.to_string().contains("secret-command"));
    }
}
