use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, watch};

use crate::cli::Priority;
use crate::config::RuntimeConfig;
use crate::retry::{RetryPolicy, with_timeout};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub complexity: f64,
    pub payload: Value,
    pub mission_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        priority: Priority,
        complexity: f64,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            priority,
            complexity: complexity.clamp(0.0, 1.0),
            payload,
            mission_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_mission(mut self, mission_id: impl Into<String>) -> Self {
        self.mission_id = Some(mission_id.into());
        self
    }

    pub fn description(&self) -> &str {
        self.payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub task_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl QueueSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_tasks.max(1),
            task_timeout: Duration::from_secs(cfg.task_timeout_secs),
            max_retries: cfg.max_retries.max(1),
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedTask {
    priority: Priority,
    seq: u64,
    id: String,
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: the "greatest" entry has the most urgent
    // priority and the lowest sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    records: HashMap<String, TaskRecord>,
    next_seq: u64,
}

/// Pops tasks by priority, FIFO within a priority. Each attempt runs under
/// the task timeout and failures retry with backoff up to `max_retries`.
pub struct TaskQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    work: Notify,
    progress: Notify,
    semaphore: Arc<Semaphore>,
    telemetry: TelemetrySink,
}

impl TaskQueue {
    pub fn new(settings: QueueSettings, telemetry: TelemetrySink) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            progress: Notify::new(),
            telemetry,
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_task(&self, task: Task) -> Result<()> {
        let id = task.id.clone();
        let priority = task.priority;
        {
            let mut state = self.lock_state();
            if state.records.contains_key(&id) {
                return Err(anyhow::anyhow!("task '{}' already exists in the queue", id));
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.heap.push(QueuedTask {
                priority,
                seq,
                id: id.clone(),
            });
            state.records.insert(
                id.clone(),
                TaskRecord {
                    task,
                    status: TaskStatus::Pending,
                    attempts: 0,
                    result: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                },
            );
        }
        tracing::debug!(task_id = %id, priority = priority.label(), "task queued");
        self.work.notify_one();
        Ok(())
    }

    /// Pops the most urgent pending task and marks it running.
    fn pop_next(&self) -> Option<Task> {
        let mut state = self.lock_state();
        while let Some(entry) = state.heap.pop() {
            if let Some(record) = state.records.get_mut(&entry.id) {
                if record.status == TaskStatus::Pending {
                    record.status = TaskStatus::Running;
                    record.started_at = Some(Utc::now());
                    return Some(record.task.clone());
                }
            }
        }
        None
    }

    fn update_record(&self, id: &str, apply: impl FnOnce(&mut TaskRecord)) {
        let mut state = self.lock_state();
        if let Some(record) = state.records.get_mut(id) {
            apply(record);
        }
    }

    pub fn record(&self, id: &str) -> Option<TaskRecord> {
        self.lock_state().records.get(id).cloned()
    }

    pub fn records_for_mission(&self, mission_id: &str) -> Vec<TaskRecord> {
        let mut records = self
            .lock_state()
            .records
            .values()
            .filter(|record| record.task.mission_id.as_deref() == Some(mission_id))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.task.id.cmp(&b.task.id));
        records
    }

    pub fn pending_len(&self) -> usize {
        self.lock_state()
            .records
            .values()
            .filter(|record| record.status == TaskStatus::Pending)
            .count()
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.lock_state();
        let mut status = QueueStatus {
            max_concurrent: self.settings.max_concurrent,
            ..QueueStatus::default()
        };
        for record in state.records.values() {
            match record.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Running => status.running += 1,
                TaskStatus::Retrying => status.retrying += 1,
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Dispatch loop. Returns once `shutdown` flips or its sender is dropped;
    /// tasks already started keep running in their own spawned futures.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn TaskHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(
            max_concurrent = self.settings.max_concurrent,
            task_timeout_secs = self.settings.task_timeout.as_secs(),
            max_retries = self.settings.max_retries,
            "task queue dispatcher started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.context("task queue semaphore closed")?
                }
                _ = shutdown.changed() => break,
            };

            let next = loop {
                if let Some(task) = self.pop_next() {
                    break Some(task);
                }
                tokio::select! {
                    _ = self.work.notified() => {}
                    _ = shutdown.changed() => break None,
                }
            };
            let Some(task) = next else {
                break;
            };

            let queue = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                queue.execute(task, handler).await;
            });
        }
        tracing::info!("task queue dispatcher stopped");
        Ok(())
    }

    async fn execute(&self, task: Task, handler: Arc<dyn TaskHandler>) {
        let policy = RetryPolicy::new(self.settings.max_retries, self.settings.retry_base_delay);
        let label = format!("task '{}'", task.id);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.update_record(&task.id, |record| {
                record.status = TaskStatus::Running;
                record.attempts = attempt;
            });
            tracing::debug!(task_id = %task.id, task_type = %task.task_type, attempt, "task attempt started");

            match with_timeout(self.settings.task_timeout, &label, handler.handle(&task)).await {
                Ok(result) => {
                    self.update_record(&task.id, |record| {
                        record.status = TaskStatus::Completed;
                        record.result = Some(result);
                        record.error = None;
                        record.finished_at = Some(Utc::now());
                    });
                    tracing::info!(task_id = %task.id, attempts = attempt, "task completed");
                    self.telemetry.emit(
                        "task.completed",
                        json!({
                            "task_id": task.id,
                            "task_type": task.task_type,
                            "attempts": attempt
                        }),
                    );
                    break;
                }
                Err(err) if attempt >= policy.max_attempts => {
                    let message = format!("{err:#}");
                    self.update_record(&task.id, |record| {
                        record.status = TaskStatus::Failed;
                        record.error = Some(message.clone());
                        record.finished_at = Some(Utc::now());
                    });
                    tracing::error!(task_id = %task.id, attempts = attempt, error = %message, "task failed");
                    self.telemetry.emit(
                        "task.failed",
                        json!({
                            "task_id": task.id,
                            "task_type": task.task_type,
                            "attempts": attempt,
                            "error": message
                        }),
                    );
                    break;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    let wait = policy.delay_after(attempt);
                    self.update_record(&task.id, |record| {
                        record.status = TaskStatus::Retrying;
                        record.error = Some(message.clone());
                    });
                    tracing::warn!(
                        task_id = %task.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %message,
                        "task attempt failed, retrying"
                    );
                    self.telemetry.emit(
                        "task.retrying",
                        json!({
                            "task_id": task.id,
                            "attempt": attempt,
                            "wait_ms": wait.as_millis() as u64
                        }),
                    );
                    self.progress.notify_waiters();
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        self.progress.notify_waiters();
    }

    /// Waits until every id is completed or failed.
    pub async fn wait_for(&self, ids: &[String], timeout: Duration) -> Result<Vec<TaskRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.progress.notified();
            let mut records = Vec::with_capacity(ids.len());
            let mut outstanding = 0usize;
            {
                let state = self.lock_state();
                for id in ids {
                    let record = state
                        .records
                        .get(id)
                        .ok_or_else(|| anyhow::anyhow!("unknown task '{}' in queue wait", id))?;
                    if !record.status.is_terminal() {
                        outstanding += 1;
                    }
                    records.push(record.clone());
                }
            }
            if outstanding == 0 {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(anyhow::anyhow!(
                    "timed out waiting for {} task(s) after {:.1}s",
                    outstanding,
                    timeout.as_secs_f64()
                ));
            }
        }
    }
}
