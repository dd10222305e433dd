use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};

use crate::cli::Priority;
use crate::provider::extract_json_object;
use crate::queue::{Task, TaskQueue, TaskRecord, TaskStatus};
use crate::router::{GenerateRequest, ModelRouter};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Failed | MissionStatus::TimedOut
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            MissionStatus::Pending => "pending",
            MissionStatus::Running => "running",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
            MissionStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedTask {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub complexity: f64,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionPlan {
    pub summary: String,
    pub estimated_time_hours: f64,
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<&TaskRecord> for TaskOutcome {
    fn from(record: &TaskRecord) -> Self {
        Self {
            status: record.status,
            attempts: record.attempts,
            result: record.result.clone(),
            error: record.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mission {
    pub id: String,
    pub description: String,
    pub user_id: Option<String>,
    pub priority: Priority,
    pub summary: String,
    pub estimated_time_hours: f64,
    pub tasks: Vec<PlannedTask>,
    pub status: MissionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: BTreeMap<String, TaskOutcome>,
}

pub fn fallback_plan(description: &str) -> MissionPlan {
    MissionPlan {
        summary: description.to_string(),
        estimated_time_hours: 1.0,
        tasks: vec![PlannedTask {
            id: "task_1".to_string(),
            task_type: "content".to_string(),
            description: description.to_string(),
            complexity: 0.5,
            priority: Priority::Medium,
        }],
    }
}

/// Lenient read of a model-produced plan. Tasks without a description are
/// dropped; missing or repeated ids are renumbered.
pub fn parse_plan(value: &Value, description: &str) -> Option<MissionPlan> {
    let raw_tasks = value.get("tasks")?.as_array()?;
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (idx, raw) in raw_tasks.iter().enumerate() {
        let Some(task_description) = raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
        else {
            continue;
        };
        let mut id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'))
            .map(str::to_string)
            .unwrap_or_else(|| format!("task_{}", idx + 1));
        if !seen.insert(id.clone()) {
            id = format!("{}_{}", id, idx + 1);
            seen.insert(id.clone());
        }
        tasks.push(PlannedTask {
            id,
            task_type: raw
                .get("type")
                .or_else(|| raw.get("task_type"))
                .and_then(Value::as_str)
                .map(|kind| kind.trim().to_ascii_lowercase())
                .filter(|kind| !kind.is_empty())
                .unwrap_or_else(|| "content".to_string()),
            description: task_description.to_string(),
            complexity: raw
                .get("complexity")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            priority: raw
                .get("priority")
                .and_then(Value::as_str)
                .map(Priority::parse_or_medium)
                .unwrap_or(Priority::Medium),
        });
    }
    if tasks.is_empty() {
        return None;
    }
    Some(MissionPlan {
        summary: value
            .get("mission_summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| description.to_string()),
        estimated_time_hours: value
            .get("estimated_time_hours")
            .and_then(Value::as_f64)
            .filter(|hours| *hours > 0.0)
            .unwrap_or(1.0),
        tasks,
    })
}

struct CeoShared {
    router: Arc<ModelRouter>,
    queue: Arc<TaskQueue>,
    missions: RwLock<HashMap<String, Mission>>,
    finished: Notify,
    mission_timeout: Duration,
    telemetry: TelemetrySink,
}

/// Plans missions into tasks, queues them and follows them to a terminal status.
#[derive(Clone)]
pub struct CeoAgent {
    shared: Arc<CeoShared>,
}

impl CeoAgent {
    pub fn new(
        router: Arc<ModelRouter>,
        queue: Arc<TaskQueue>,
        mission_timeout: Duration,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            shared: Arc::new(CeoShared {
                router,
                queue,
                missions: RwLock::new(HashMap::new()),
                finished: Notify::new(),
                mission_timeout,
                telemetry,
            }),
        }
    }

    pub async fn analyze_mission(&self, description: &str) -> MissionPlan {
        let prompt = format!(
            "Analyze the mission and produce a task plan.\n\nMission: {description}\n\n\
             Reply with JSON only:\n\
             {{\"mission_summary\": \"...\", \"estimated_time_hours\": 2.5, \"tasks\": [\
             {{\"id\": \"task_1\", \"type\": \"content|code|research|devops\", \
             \"description\": \"...\", \"complexity\": 0.7, \"priority\": \"critical|high|medium|low\"}}]}}"
        );
        let request = GenerateRequest::new(prompt, "planning", 0.9)
            .with_system_prompt("You are the CEO of an AI company. Break missions into concrete, independent tasks.")
            .with_max_tokens(4000)
            .with_temperature(0.3);
        match self.shared.router.generate(request).await {
            Ok(response) => match extract_json_object(&response.text)
                .and_then(|value| parse_plan(&value, description))
            {
                Some(plan) => plan,
                None => {
                    tracing::warn!("mission plan was not usable JSON, using fallback plan");
                    fallback_plan(description)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "mission analysis failed, using fallback plan");
                fallback_plan(description)
            }
        }
    }

    /// Plans and stores the mission, then runs it in the background.
    pub async fn receive_mission(
        &self,
        description: &str,
        user_id: Option<String>,
        priority: Priority,
    ) -> Result<String> {
        let plan = self.analyze_mission(description).await;

        let mission_id = {
            let mut missions = self.shared.missions.write().await;
            let mut mission_id = format!("mission_{:08x}", rand::random::<u32>());
            while missions.contains_key(&mission_id) {
                mission_id = format!("mission_{:08x}", rand::random::<u32>());
            }
            missions.insert(
                mission_id.clone(),
                Mission {
                    id: mission_id.clone(),
                    description: description.to_string(),
                    user_id,
                    priority,
                    summary: plan.summary,
                    estimated_time_hours: plan.estimated_time_hours,
                    tasks: plan.tasks,
                    status: MissionStatus::Pending,
                    created_at: Utc::now(),
                    completed_at: None,
                    results: BTreeMap::new(),
                },
            );
            mission_id
        };

        tracing::info!(mission_id = %mission_id, priority = priority.label(), "mission accepted");
        self.shared.telemetry.emit(
            "mission.accepted",
            json!({ "mission_id": mission_id, "priority": priority.label() }),
        );

        let shared = self.shared.clone();
        let id = mission_id.clone();
        tokio::spawn(async move {
            execute_mission(shared, id).await;
        });
        Ok(mission_id)
    }

    pub async fn get_mission(&self, mission_id: &str) -> Option<Mission> {
        self.shared.missions.read().await.get(mission_id).cloned()
    }

    /// Newest first.
    pub async fn list_missions(&self) -> Vec<Mission> {
        let mut missions = self
            .shared
            .missions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        missions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        missions
    }

    pub async fn mission_count(&self) -> usize {
        self.shared.missions.read().await.len()
    }

    /// Resolves once the mission reaches a terminal status.
    pub async fn wait_for_mission(&self, mission_id: &str, timeout: Duration) -> Result<Mission> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.finished.notified();
            let mission = self
                .get_mission(mission_id)
                .await
                .ok_or_else(|| anyhow::anyhow!("mission '{}' not found", mission_id))?;
            if mission.status.is_terminal() {
                return Ok(mission);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(anyhow::anyhow!(
                    "timed out waiting for mission '{}' after {:.1}s",
                    mission_id,
                    timeout.as_secs_f64()
                ));
            }
        }
    }
}

async fn set_status(shared: &CeoShared, mission_id: &str, status: MissionStatus) {
    if let Some(mission) = shared.missions.write().await.get_mut(mission_id) {
        mission.status = status;
    }
}

async fn execute_mission(shared: Arc<CeoShared>, mission_id: String) {
    let Some((tasks, mission_priority)) = shared
        .missions
        .read()
        .await
        .get(&mission_id)
        .map(|mission| (mission.tasks.clone(), mission.priority))
    else {
        return;
    };
    set_status(&shared, &mission_id, MissionStatus::Running).await;
    tracing::info!(mission_id = %mission_id, tasks = tasks.len(), "mission started");

    let mut queued_ids = Vec::with_capacity(tasks.len());
    let mut results = BTreeMap::new();
    for planned in &tasks {
        let task_id = format!("{}_{}", mission_id, planned.id);
        let task = Task::new(
            task_id.clone(),
            planned.task_type.clone(),
            // A task never runs less urgently than its mission.
            planned.priority.min(mission_priority),
            planned.complexity,
            json!({ "description": planned.description, "mission_id": mission_id }),
        )
        .with_mission(mission_id.clone());
        match shared.queue.add_task(task) {
            Ok(()) => queued_ids.push(task_id),
            Err(err) => {
                tracing::error!(mission_id = %mission_id, task_id = %task_id, error = %err, "failed to enqueue mission task");
                results.insert(
                    task_id,
                    TaskOutcome {
                        status: TaskStatus::Failed,
                        attempts: 0,
                        result: None,
                        error: Some(format!("{err:#}")),
                    },
                );
            }
        }
    }

    let waited = shared.queue.wait_for(&queued_ids, shared.mission_timeout).await;
    let (status, event) = match &waited {
        Ok(records) => {
            for record in records {
                results.insert(record.task.id.clone(), TaskOutcome::from(record));
            }
            if results
                .values()
                .all(|outcome| outcome.status == TaskStatus::Completed)
            {
                (MissionStatus::Completed, "mission.completed")
            } else {
                (MissionStatus::Failed, "mission.failed")
            }
        }
        Err(err) => {
            tracing::error!(mission_id = %mission_id, error = %err, "mission timed out");
            for id in &queued_ids {
                if let Some(record) = shared.queue.record(id) {
                    results.insert(id.clone(), TaskOutcome::from(&record));
                }
            }
            (MissionStatus::TimedOut, "mission.timed_out")
        }
    };

    let completed = results
        .values()
        .filter(|outcome| outcome.status == TaskStatus::Completed)
        .count();
    let total = results.len();
    if let Some(mission) = shared.missions.write().await.get_mut(&mission_id) {
        mission.results = results;
        mission.status = status;
        mission.completed_at = Some(Utc::now());
    }
    match status {
        MissionStatus::Completed => {
            tracing::info!(mission_id = %mission_id, total, "mission completed");
        }
        _ => {
            tracing::warn!(mission_id = %mission_id, status = status.label(), completed, total, "mission finished unsuccessfully");
        }
    }
    shared.telemetry.emit(
        event,
        json!({
            "mission_id": mission_id,
            "status": status.label(),
            "tasks_completed": completed,
            "tasks_total": total
        }),
    );
    shared.finished.notify_waiters();
}
