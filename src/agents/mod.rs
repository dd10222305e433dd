/// Specialist agents and the registry that routes queued tasks to them.
///
/// - `ceo`: turns missions into planned tasks and tracks them
/// - `content`: articles and other written content
/// - `devops`: code generation and analysis
///
/// Tasks whose type no specialist claims go to [`GeneralAgent`].
pub mod ceo;
pub mod content;
pub mod devops;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::queue::{Task, TaskHandler};
use crate::router::{GenerateRequest, ModelResponse, ModelRouter};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub agent_name: String,
    pub model_used: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl AgentResult {
    pub fn succeeded(agent_name: &str, data: Value, usage: Usage) -> Self {
        Self {
            success: true,
            data,
            error: None,
            agent_name: agent_name.to_string(),
            model_used: usage.model_used,
            tokens_used: usage.tokens,
            cost_usd: usage.cost_usd,
        }
    }

    pub fn failed(agent_name: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            agent_name: agent_name.to_string(),
            model_used: String::new(),
            tokens_used: 0,
            cost_usd: 0.0,
        }
    }
}

/// Model usage accumulated over the calls that produced one result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub model_used: String,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, response: &ModelResponse) {
        if self.model_used.is_empty() {
            self.model_used = response.model_used.clone();
        }
        self.tokens += response.tokens_used();
        self.cost_usd += response.cost_usd;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub agent: String,
    pub tasks_completed: u64,
    pub total_cost: f64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    inner: Mutex<(u64, f64)>,
}

impl StatsTracker {
    pub(crate) fn record(&self, usage: &Usage) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 += 1;
        guard.1 += usage.cost_usd;
    }

    pub(crate) fn snapshot(&self, agent: &str) -> AgentStats {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        AgentStats {
            agent: agent.to_string(),
            tasks_completed: guard.0,
            total_cost: (guard.1 * 10_000.0).round() / 10_000.0,
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<&'static str>;

    fn handles(&self, task_type: &str) -> bool;

    async fn execute(&self, task: &Task) -> Result<AgentResult>;

    fn stats(&self) -> AgentStats;
}

/// Answers any task with a single model call on its description.
pub struct GeneralAgent {
    router: Arc<ModelRouter>,
    stats: StatsTracker,
}

impl GeneralAgent {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self {
            router,
            stats: StatsTracker::default(),
        }
    }
}

#[async_trait]
impl Agent for GeneralAgent {
    fn name(&self) -> &str {
        "general"
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec!["general"]
    }

    fn handles(&self, _task_type: &str) -> bool {
        true
    }

    async fn execute(&self, task: &Task) -> Result<AgentResult> {
        let description = task.description();
        if description.trim().is_empty() {
            return Ok(AgentResult::failed(
                self.name(),
                format!("task '{}' has no description", task.id),
            ));
        }
        let response = self
            .router
            .generate(GenerateRequest::new(description, &task.task_type, task.complexity))
            .await?;
        let mut usage = Usage::default();
        usage.add(&response);
        self.stats.record(&usage);
        Ok(AgentResult::succeeded(
            self.name(),
            json!({ "text": response.text }),
            usage,
        ))
    }

    fn stats(&self) -> AgentStats {
        self.stats.snapshot(self.name())
    }
}

pub struct AgentRegistry {
    specialists: Vec<Arc<dyn Agent>>,
    fallback: Arc<dyn Agent>,
}

impl AgentRegistry {
    pub fn new(fallback: Arc<dyn Agent>) -> Self {
        Self {
            specialists: Vec::new(),
            fallback,
        }
    }

    pub fn register(mut self, agent: Arc<dyn Agent>) -> Self {
        self.specialists.push(agent);
        self
    }

    pub fn route(&self, task_type: &str) -> Arc<dyn Agent> {
        self.specialists
            .iter()
            .find(|agent| agent.handles(task_type))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.specialists
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|agent| agent.name().to_string())
            .collect()
    }

    pub fn stats(&self) -> Vec<AgentStats> {
        self.specialists
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|agent| agent.stats())
            .collect()
    }
}

#[async_trait]
impl TaskHandler for AgentRegistry {
    async fn handle(&self, task: &Task) -> Result<Value> {
        let agent = self.route(&task.task_type);
        tracing::debug!(task_id = %task.id, task_type = %task.task_type, agent = agent.name(), "dispatching task");
        let result = agent.execute(task).await?;
        if !result.success {
            return Err(anyhow::anyhow!(
                "agent '{}' failed task '{}': {}",
                result.agent_name,
                task.id,
                result.error.as_deref().unwrap_or("no error detail")
            ));
        }
        Ok(serde_json::to_value(&result)?)
    }
}

/// Reads a string field from a task payload, treating blanks as absent.
pub(crate) fn payload_str<'a>(task: &'a Task, key: &str) -> Option<&'a str> {
    task.payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
