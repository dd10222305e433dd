use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use clap::Parser;
use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::sync::watch;

use crate::agents::ceo::{MissionStatus, fallback_plan, parse_plan};
use crate::agents::content::{
    ContentAgent, analyze_seo, assemble_body, build_meta, count_words, fallback_structure,
    insert_after_first_paragraph, keyword_footer, readability_score, section_word_budgets,
    split_long_paragraphs, truncate_to_words,
};
use crate::agents::devops::{DevOpsAgent, analyze_code, extract_code_block};
use crate::agents::{Agent, AgentRegistry, GeneralAgent};
use crate::app::Corporation;
use crate::cli::*;
use crate::config::*;
use crate::deploy::*;
use crate::error::*;
use crate::parser::{MAX_PAGE_CHARS, PageFetcher, clean_html, post_process};
use crate::provider::{Backend, Completion, CompletionRequest, LlmClient, extract_json_object};
use crate::queue::{QueueSettings, Task, TaskHandler, TaskQueue, TaskStatus};
use crate::retry::*;
use crate::router::{GenerateRequest, ModelRouter, RouterClients};
use crate::server::*;
use crate::setup::*;
use crate::telemetry::*;
use crate::validators::*;
use crate::vram::{ModelPuller, VramManager};

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        config_path: "configs/ai-corp.toml".to_string(),
        config_loaded: false,
        ollama_base_url: "http://localhost:11434".to_string(),
        cloud_threshold: 0.8,
        request_timeout_secs: 30,
        gpu_total_vram_gb: 64.0,
        gpu_reserved_vram_gb: 2.0,
        gpu_max_models_loaded: 3,
        model_load_timeout_secs: 5,
        max_concurrent_tasks: 3,
        task_timeout_secs: 5,
        max_retries: 2,
        retry_base_delay_ms: 0,
        mission_timeout_secs: 10,
        server_host: "127.0.0.1".to_string(),
        server_port: 8000,
        compose_command: "docker compose".to_string(),
        health_url: "http://localhost:8000/health".to_string(),
        deploy_wait_secs: 0,
        panel_url: "http://localhost:8080".to_string(),
        required_tools: vec!["git".to_string()],
        output_dir: "output".to_string(),
        logs_dir: "logs".to_string(),
        telemetry_enabled: false,
        telemetry_path: "logs/test-telemetry.jsonl".to_string(),
        show_sensitive_config: false,
        models: default_model_catalog(),
    }
}

fn test_cli(config_path: &str) -> Cli {
    Cli {
        config_path: config_path.to_string(),
        ollama_base_url: None,
        max_concurrent_tasks: None,
        task_timeout_secs: None,
        max_retries: None,
        gpu_total_vram_gb: None,
        gpu_reserved_vram_gb: None,
        gpu_max_models_loaded: None,
        output_dir: None,
        logs_dir: None,
        telemetry_enabled: None,
        telemetry_path: None,
        show_sensitive_config: false,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

/// Replays scripted replies in order, then the fallback (or an error).
struct ScriptedLlm {
    backend: Backend,
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(backend: Backend, replies: Vec<Result<&str, &str>>, fallback: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|reply| reply.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            fallback: fallback.map(str::to_string),
            calls: AtomicUsize::new(0),
        })
    }

    fn answering(backend: Backend, text: &str) -> Arc<Self> {
        Self::new(backend, Vec::new(), Some(text))
    }

    fn failing(backend: Backend) -> Arc<Self> {
        Self::new(backend, Vec::new(), None)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| "scripted backend has no reply".to_string()),
        };
        match reply {
            Ok(text) => Ok(Completion {
                text,
                tokens_in: 10,
                tokens_out: 20,
            }),
            Err(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

#[derive(Default)]
struct FakePuller {
    fail: bool,
    pulls: AtomicUsize,
    removes: AtomicUsize,
}

#[async_trait]
impl ModelPuller for FakePuller {
    async fn pull(&self, full_name: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("pull of '{}' refused", full_name));
        }
        Ok(())
    }

    async fn remove(&self, _full_name: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves canned HTML by URL; anything else answers 404.
#[derive(Default)]
struct StaticPages {
    pages: HashMap<String, String>,
    fetches: AtomicUsize,
}

impl StaticPages {
    fn with(pages: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|(url, html)| (url.to_string(), html.to_string()))
                .collect(),
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("'{}' answered HTTP 404", url))
    }
}

fn local_only(llm: Arc<ScriptedLlm>) -> RouterClients {
    RouterClients {
        local: Some(llm),
        claude: None,
        openai: None,
    }
}

fn router_with(cfg: &RuntimeConfig, clients: RouterClients) -> Arc<ModelRouter> {
    let vram = Arc::new(VramManager::new(
        cfg.gpu_total_vram_gb,
        cfg.gpu_reserved_vram_gb,
        cfg.gpu_max_models_loaded,
        Arc::new(FakePuller::default()),
    ));
    Arc::new(ModelRouter::new(cfg, vram, clients))
}

fn corp_with(llm: Arc<ScriptedLlm>) -> Corporation {
    Corporation::with_components(
        base_cfg(),
        TelemetrySink::disabled(),
        local_only(llm),
        Arc::new(FakePuller::default()),
        Arc::new(StaticPages::default()),
    )
}

fn queue_settings(max_concurrent: usize, max_retries: u32, task_timeout: Duration) -> QueueSettings {
    QueueSettings {
        max_concurrent,
        task_timeout,
        max_retries,
        retry_base_delay: Duration::ZERO,
    }
}

fn task(id: &str, priority: Priority) -> Task {
    Task::new(id, "general", priority, 0.5, json!({ "description": id }))
}

async fn run_until_done(queue: Arc<TaskQueue>, handler: Arc<dyn TaskHandler>, ids: &[&str]) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(queue.clone().run(handler, shutdown_rx));
    let ids = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
    queue
        .wait_for(&ids, Duration::from_secs(10))
        .await
        .expect("tasks should finish");
    shutdown_tx.send(true).expect("dispatcher should be listening");
    dispatcher
        .await
        .expect("dispatcher should not panic")
        .expect("dispatcher should stop cleanly");
}

async fn serve_router(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server should run");
    });
    addr
}

fn server_state(auth_token: Option<&str>) -> Arc<ServerState> {
    Arc::new(ServerState {
        corp: Arc::new(corp_with(ScriptedLlm::answering(Backend::Ollama, "ok"))),
        telemetry: TelemetrySink::disabled(),
        auth_token: auth_token.map(str::to_string),
    })
}

struct RecordingHandler {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &Task) -> Result<Value> {
        self.order.lock().unwrap().push(task.id.clone());
        Ok(json!({ "done": task.id }))
    }
}

struct ConcurrencyHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskHandler for ConcurrencyHandler {
    async fn handle(&self, _task: &Task) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Fails the first `failures` calls, then succeeds.
struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, _task: &Task) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(anyhow::anyhow!("backend unavailable (call {call})"));
        }
        Ok(json!({ "call": call }))
    }
}

struct SlowHandler;

#[async_trait]
impl TaskHandler for SlowHandler {
    async fn handle(&self, _task: &Task) -> Result<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn queue_runs_higher_priority_first_and_fifo_within_priority() {
    let queue = Arc::new(TaskQueue::new(
        queue_settings(1, 1, Duration::from_secs(5)),
        TelemetrySink::disabled(),
    ));
    queue.add_task(task("low-1", Priority::Low)).expect("queue low-1");
    queue.add_task(task("high-1", Priority::High)).expect("queue high-1");
    queue.add_task(task("high-2", Priority::High)).expect("queue high-2");
    queue.add_task(task("critical", Priority::Critical)).expect("queue critical");
    queue.add_task(task("low-2", Priority::Low)).expect("queue low-2");
    assert_eq!(queue.pending_len(), 5);

    let handler = Arc::new(RecordingHandler {
        order: Mutex::new(Vec::new()),
    });
    run_until_done(
        queue.clone(),
        handler.clone(),
        &["low-1", "high-1", "high-2", "critical", "low-2"],
    )
    .await;

    let order = handler.order.lock().unwrap().clone();
    assert_eq!(order, vec!["critical", "high-1", "high-2", "low-1", "low-2"]);
    let status = queue.queue_status();
    assert_eq!(status.completed, 5);
    assert_eq!(status.pending, 0);
    assert_eq!(status.max_concurrent, 1);
}

#[tokio::test]
async fn queue_never_exceeds_max_concurrent_tasks() {
    let queue = Arc::new(TaskQueue::new(
        queue_settings(2, 1, Duration::from_secs(5)),
        TelemetrySink::disabled(),
    ));
    let ids = ["t1", "t2", "t3", "t4", "t5", "t6"];
    for id in ids {
        queue.add_task(task(id, Priority::Medium)).expect("queue task");
    }
    let handler = Arc::new(ConcurrencyHandler {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    run_until_done(queue.clone(), handler.clone(), &ids).await;

    assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    assert_eq!(queue.queue_status().completed, 6);
}

#[tokio::test]
async fn queue_retries_failed_attempt_until_success() {
    let queue = Arc::new(TaskQueue::new(
        queue_settings(1, 3, Duration::from_secs(5)),
        TelemetrySink::disabled(),
    ));
    queue.add_task(task("flaky", Priority::High)).expect("queue task");
    let handler = Arc::new(FlakyHandler {
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    run_until_done(queue.clone(), handler.clone(), &["flaky"]).await;

    let record = queue.record("flaky").expect("record should exist");
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.result, Some(json!({ "call": 2 })));
    assert!(record.error.is_none());
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn queue_fails_task_after_max_retries() {
    let queue = Arc::new(TaskQueue::new(
        queue_settings(1, 3, Duration::from_secs(5)),
        TelemetrySink::disabled(),
    ));
    queue.add_task(task("doomed", Priority::Medium)).expect("queue task");
    let handler = Arc::new(FlakyHandler {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    run_until_done(queue.clone(), handler.clone(), &["doomed"]).await;

    let record = queue.record("doomed").expect("record should exist");
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(
        record
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("backend unavailable")
    );
}

#[tokio::test]
async fn queue_counts_timed_out_attempt_as_failure() {
    let queue = Arc::new(TaskQueue::new(
        queue_settings(1, 1, Duration::from_millis(50)),
        TelemetrySink::disabled(),
    ));
    queue.add_task(task("slow", Priority::Medium)).expect("queue task");
    run_until_done(queue.clone(), Arc::new(SlowHandler), &["slow"]).await;

    let record = queue.record("slow").expect("record should exist");
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(
        record
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out")
    );
}

#[test]
fn queue_rejects_duplicate_task_ids() {
    let queue = TaskQueue::new(
        queue_settings(1, 1, Duration::from_secs(1)),
        TelemetrySink::disabled(),
    );
    queue.add_task(task("dup", Priority::Low)).expect("first insert");
    let err = queue
        .add_task(task("dup", Priority::High))
        .expect_err("duplicate id should be rejected");
    assert!(err.to_string().contains("already exists"));
    assert_eq!(queue.queue_status().pending, 1);
}

#[tokio::test]
async fn queue_wait_for_times_out_without_dispatcher() {
    let queue = TaskQueue::new(
        queue_settings(1, 1, Duration::from_secs(1)),
        TelemetrySink::disabled(),
    );
    queue.add_task(task("idle", Priority::Low)).expect("queue task");

    let err = queue
        .wait_for(&["idle".to_string()], Duration::from_millis(30))
        .await
        .expect_err("pending task should time out");
    assert!(err.to_string().contains("timed out"));

    let err = queue
        .wait_for(&["ghost".to_string()], Duration::from_millis(30))
        .await
        .expect_err("unknown task should be reported");
    assert!(err.to_string().contains("unknown task 'ghost'"));
}

#[test]
fn queue_settings_clamp_zero_values() {
    let mut cfg = base_cfg();
    cfg.max_concurrent_tasks = 0;
    cfg.max_retries = 0;
    let settings = QueueSettings::from_config(&cfg);
    assert_eq!(settings.max_concurrent, 1);
    assert_eq!(settings.max_retries, 1);
}

#[test]
fn router_picks_local_tier_by_complexity() {
    let cfg = base_cfg();
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));

    assert_eq!(router.select_model("general", 0.1).tier, ModelTier::LocalSmall);
    assert_eq!(router.select_model("general", 0.5).tier, ModelTier::LocalMedium);
    assert_eq!(router.select_model("general", 0.7).tier, ModelTier::LocalLarge);
    assert_eq!(router.select_model("code", 0.1).tier, ModelTier::LocalMedium);
    assert_eq!(router.select_model("general", 0.1).model, "qwen2.5:7b");
    // No cloud client: high complexity stays local.
    assert_eq!(router.select_model("general", 0.95).tier, ModelTier::LocalLarge);
}

#[test]
fn router_prefers_cloud_above_threshold() {
    let cfg = base_cfg();
    let both = router_with(
        &cfg,
        RouterClients {
            local: Some(ScriptedLlm::answering(Backend::Ollama, "ok")),
            claude: Some(ScriptedLlm::answering(Backend::Anthropic, "ok")),
            openai: Some(ScriptedLlm::answering(Backend::Openai, "ok")),
        },
    );
    assert_eq!(both.select_model("planning", 0.9).tier, ModelTier::CloudClaude);
    assert_eq!(both.select_model("general", 0.2).tier, ModelTier::LocalSmall);

    let openai_only = router_with(
        &cfg,
        RouterClients {
            local: Some(ScriptedLlm::answering(Backend::Ollama, "ok")),
            claude: None,
            openai: Some(ScriptedLlm::answering(Backend::Openai, "ok")),
        },
    );
    let choice = openai_only.select_model("planning", 0.85);
    assert_eq!(choice.tier, ModelTier::CloudOpenai);
    assert_eq!(choice.model, "gpt-4o-mini");

    let cloud_only = router_with(
        &cfg,
        RouterClients {
            local: None,
            claude: Some(ScriptedLlm::answering(Backend::Anthropic, "ok")),
            openai: None,
        },
    );
    assert_eq!(cloud_only.select_model("general", 0.1).tier, ModelTier::CloudClaude);
}

#[test]
fn router_falls_back_when_vram_is_insufficient() {
    let mut cfg = base_cfg();
    cfg.gpu_total_vram_gb = 12.0;
    cfg.gpu_reserved_vram_gb = 0.0;
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));
    assert_eq!(router.select_model("general", 0.7).tier, ModelTier::LocalMedium);

    cfg.gpu_total_vram_gb = 4.0;
    let starved = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));
    assert_eq!(starved.select_model("general", 0.7).tier, ModelTier::LocalSmall);

    let with_cloud = router_with(
        &cfg,
        RouterClients {
            local: Some(ScriptedLlm::answering(Backend::Ollama, "ok")),
            claude: Some(ScriptedLlm::answering(Backend::Anthropic, "ok")),
            openai: None,
        },
    );
    assert_eq!(with_cloud.select_model("general", 0.7).tier, ModelTier::CloudClaude);
}

#[tokio::test]
async fn router_retries_on_cloud_when_local_call_fails() {
    let cfg = base_cfg();
    let local = ScriptedLlm::failing(Backend::Ollama);
    let claude = ScriptedLlm::answering(Backend::Anthropic, "from the cloud");
    let router = router_with(
        &cfg,
        RouterClients {
            local: Some(local.clone()),
            claude: Some(claude.clone()),
            openai: None,
        },
    );

    let response = router
        .generate(GenerateRequest::new("hello", "general", 0.2))
        .await
        .expect("cloud fallback should answer");
    assert_eq!(response.text, "from the cloud");
    assert_eq!(response.tier, ModelTier::CloudClaude);
    assert_eq!(response.tokens_used(), 30);
    assert!((response.cost_usd - 30.0 / 1000.0 * 0.009).abs() < 1e-12);
    assert_eq!(local.calls(), 1);
    assert_eq!(claude.calls(), 1);

    let usage = router.usage();
    assert_eq!(usage.cloud_fallbacks, 1);
    assert_eq!(usage.requests, 1);
}

#[tokio::test]
async fn router_loads_local_model_once_and_charges_nothing() {
    let cfg = base_cfg();
    let puller = Arc::new(FakePuller::default());
    let vram = Arc::new(VramManager::new(64.0, 2.0, 3, puller.clone()));
    let router = ModelRouter::new(
        &cfg,
        vram.clone(),
        local_only(ScriptedLlm::answering(Backend::Ollama, "local answer")),
    );

    for _ in 0..2 {
        let response = router
            .generate(GenerateRequest::new("hello", "general", 0.1))
            .await
            .expect("local model should answer");
        assert_eq!(response.text, "local answer");
        assert_eq!(response.cost_usd, 0.0);
    }
    assert_eq!(puller.pulls.load(Ordering::SeqCst), 1);
    assert!(vram.is_loaded(ModelTier::LocalSmall));
    assert_eq!(router.available_models().loaded, vec!["local_small"]);
    assert!(router.available_models().cloud.is_empty());
}

#[tokio::test]
async fn router_without_cloud_surfaces_local_error() {
    let cfg = base_cfg();
    let router = router_with(&cfg, local_only(ScriptedLlm::failing(Backend::Ollama)));
    let err = router
        .generate(GenerateRequest::new("hello", "general", 0.1))
        .await
        .expect_err("no fallback is available");
    assert!(format!("{err:#}").contains("ollama model 'qwen2.5:7b' request failed"));
}

fn shipped_vram(mut cfg: RuntimeConfig) -> RuntimeConfig {
    cfg.gpu_total_vram_gb = 24.0;
    cfg.gpu_reserved_vram_gb = 2.0;
    cfg.gpu_max_models_loaded = 2;
    cfg
}

#[tokio::test]
async fn router_reuses_resident_large_model_when_smaller_tiers_do_not_fit() {
    let cfg = shipped_vram(base_cfg());
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));

    let planning = router
        .generate(GenerateRequest::new("plan", "planning", 0.9))
        .await
        .expect("large model should load into an empty GPU");
    assert_eq!(planning.tier, ModelTier::LocalLarge);

    for (task_type, complexity) in [("content", 0.5), ("general", 0.2), ("code", 0.7)] {
        let response = router
            .generate(GenerateRequest::new("work", task_type, complexity))
            .await
            .expect("resident model should serve smaller requests");
        assert_eq!(response.tier, ModelTier::LocalLarge);
    }
    assert_eq!(router.vram().loaded_tiers(), vec![ModelTier::LocalLarge]);
}

#[tokio::test]
async fn router_respects_model_limit_when_picking_a_tier() {
    let mut cfg = base_cfg();
    cfg.gpu_max_models_loaded = 1;
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));

    router
        .generate(GenerateRequest::new("hello", "general", 0.1))
        .await
        .expect("small model should load");
    assert_eq!(router.select_model("general", 0.5).tier, ModelTier::LocalSmall);
    let response = router
        .generate(GenerateRequest::new("more", "general", 0.5))
        .await
        .expect("loaded small model should answer");
    assert_eq!(response.tier, ModelTier::LocalSmall);
    assert_eq!(router.vram().loaded_tiers(), vec![ModelTier::LocalSmall]);
}

#[tokio::test]
async fn mission_completes_with_shipped_vram_settings() {
    let plan = json!({
        "tasks": [{"id": "task_1", "type": "content", "description": "Draft the post", "complexity": 0.5}]
    })
    .to_string();
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok(plan.as_str())], Some("task output"));
    let corp = Corporation::with_components(
        shipped_vram(base_cfg()),
        TelemetrySink::disabled(),
        local_only(llm),
        Arc::new(FakePuller::default()),
        Arc::new(StaticPages::default()),
    );
    corp.start().await;

    let mission_id = corp
        .ceo
        .receive_mission("Draft a launch blog post", None, Priority::Medium)
        .await
        .expect("mission should be accepted");
    let mission = corp
        .ceo
        .wait_for_mission(&mission_id, Duration::from_secs(10))
        .await
        .expect("mission should finish");
    corp.shutdown().await.expect("shutdown should succeed");

    assert_eq!(mission.status, MissionStatus::Completed);
    let outcome = &mission.results[&format!("{mission_id}_task_1")];
    assert_eq!(outcome.attempts, 1);
}

fn spec(vram_gb: f64) -> ModelSpec {
    ModelSpec {
        name: "test-model".to_string(),
        vram_gb,
        quantization: format!("{vram_gb}gb"),
        priority: 1,
        cost_per_1k_tokens: 0.0,
    }
}

#[tokio::test]
async fn vram_refuses_models_past_budget() {
    let vram = VramManager::new(12.0, 2.0, 3, Arc::new(FakePuller::default()));
    let timeout = Duration::from_secs(1);
    assert_eq!(vram.budget_gb(), 10.0);

    assert!(vram.load_model(ModelTier::LocalMedium, &spec(10.0), timeout).await.unwrap());
    assert!(!vram.load_model(ModelTier::LocalSmall, &spec(5.0), timeout).await.unwrap());
    assert_eq!(vram.used_vram(), 10.0);
    assert!(!vram.check_vram_availability(0.5));

    let status = vram.status();
    assert_eq!(status.loaded_models.len(), 1);
    assert_eq!(status.available_vram_gb, 0.0);
}

#[tokio::test]
async fn vram_loading_same_model_twice_is_noop() {
    let puller = Arc::new(FakePuller::default());
    let vram = VramManager::new(24.0, 2.0, 2, puller.clone());
    let timeout = Duration::from_secs(1);

    assert!(vram.load_model(ModelTier::LocalSmall, &spec(5.0), timeout).await.unwrap());
    assert!(vram.load_model(ModelTier::LocalSmall, &spec(5.0), timeout).await.unwrap());
    assert_eq!(puller.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(vram.used_vram(), 5.0);

    assert!(vram.unload_model(ModelTier::LocalSmall).await.unwrap());
    assert!(!vram.unload_model(ModelTier::LocalSmall).await.unwrap());
    assert_eq!(puller.removes.load(Ordering::SeqCst), 1);
    assert_eq!(vram.used_vram(), 0.0);
}

#[tokio::test]
async fn vram_enforces_model_limit_and_pull_failures() {
    let vram = VramManager::new(64.0, 0.0, 1, Arc::new(FakePuller::default()));
    let timeout = Duration::from_secs(1);
    assert!(vram.load_model(ModelTier::LocalSmall, &spec(5.0), timeout).await.unwrap());
    assert!(!vram.load_model(ModelTier::LocalMedium, &spec(5.0), timeout).await.unwrap());

    let failing = VramManager::new(
        64.0,
        0.0,
        3,
        Arc::new(FakePuller {
            fail: true,
            ..FakePuller::default()
        }),
    );
    assert!(!failing.load_model(ModelTier::LocalSmall, &spec(5.0), timeout).await.unwrap());
    assert!(!failing.is_loaded(ModelTier::LocalSmall));

    let err = failing
        .load_model(ModelTier::CloudClaude, &spec(0.0), timeout)
        .await
        .expect_err("cloud tiers are never loaded");
    assert!(err.to_string().contains("not a local model"));
}

#[test]
fn extract_json_object_finds_first_balanced_object() {
    let text = "Here is the plan:\n```json\n{\"a\": \"brace } inside\", \"b\": {\"c\": 1}}\n```\nThanks!";
    let value = extract_json_object(text).expect("object should be found");
    assert_eq!(value["a"], "brace } inside");
    assert_eq!(value["b"]["c"], 1);

    let value = extract_json_object("{not json} then {\"ok\": true}").expect("second object");
    assert_eq!(value["ok"], true);

    assert!(extract_json_object("no structured output here").is_none());
    assert!(extract_json_object("{\"unterminated\": 1").is_none());
}

#[test]
fn parse_plan_is_lenient_with_model_output() {
    let plan = parse_plan(
        &json!({
            "mission_summary": "Launch blog",
            "estimated_time_hours": 3.5,
            "tasks": [
                {"id": "task_1", "type": "Content", "description": "Write post", "complexity": 1.7, "priority": "HIGH"},
                {"id": "task_1", "task_type": "code", "description": "Build site", "priority": "whenever"},
                {"id": "bad id!", "description": "Review"},
                {"id": "task_9", "description": "   "}
            ]
        }),
        "Launch a blog",
    )
    .expect("plan should parse");

    assert_eq!(plan.summary, "Launch blog");
    assert_eq!(plan.estimated_time_hours, 3.5);
    assert_eq!(plan.tasks.len(), 3);
    assert_eq!(plan.tasks[0].id, "task_1");
    assert_eq!(plan.tasks[0].task_type, "content");
    assert_eq!(plan.tasks[0].complexity, 1.0);
    assert_eq!(plan.tasks[0].priority, Priority::High);
    assert_eq!(plan.tasks[1].id, "task_1_2");
    assert_eq!(plan.tasks[1].task_type, "code");
    assert_eq!(plan.tasks[1].priority, Priority::Medium);
    assert_eq!(plan.tasks[2].id, "task_3");
    assert_eq!(plan.tasks[2].task_type, "content");

    assert!(parse_plan(&json!({"tasks": []}), "x").is_none());
    assert!(parse_plan(&json!({"summary": "no tasks"}), "x").is_none());
}

#[tokio::test]
async fn ceo_uses_fallback_plan_for_unparsable_output() {
    let corp = corp_with(ScriptedLlm::answering(
        Backend::Ollama,
        "I would rather not answer in JSON today.",
    ));
    let description = "Write a guide about home solar panels";
    let plan = corp.ceo.analyze_mission(description).await;
    assert_eq!(plan, fallback_plan(description));
    assert_eq!(plan.tasks[0].task_type, "content");
    assert_eq!(plan.tasks[0].complexity, 0.5);
    assert_eq!(plan.tasks[0].priority, Priority::Medium);
}

#[tokio::test]
async fn mission_completes_when_all_tasks_complete() {
    let plan = json!({
        "mission_summary": "Research and summarize",
        "estimated_time_hours": 2.0,
        "tasks": [
            {"id": "task_1", "type": "general", "description": "Collect sources", "complexity": 0.2, "priority": "low"},
            {"id": "task_2", "type": "research", "description": "Summarize findings", "complexity": 0.3, "priority": "medium"}
        ]
    })
    .to_string();
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok(plan.as_str())], Some("task output"));
    let corp = corp_with(llm.clone());
    corp.start().await;

    let mission_id = corp
        .ceo
        .receive_mission("Research solar incentives", Some("user-1".to_string()), Priority::Critical)
        .await
        .expect("mission should be accepted");
    assert!(mission_id.starts_with("mission_"));
    assert_eq!(mission_id.len(), "mission_".len() + 8);

    let mission = corp
        .ceo
        .wait_for_mission(&mission_id, Duration::from_secs(10))
        .await
        .expect("mission should finish");
    corp.shutdown().await.expect("shutdown should succeed");

    assert_eq!(mission.status, MissionStatus::Completed);
    assert_eq!(mission.summary, "Research and summarize");
    assert_eq!(mission.results.len(), 2);
    assert!(mission.completed_at.is_some());
    let first = format!("{mission_id}_task_1");
    assert_eq!(mission.results[&first].status, TaskStatus::Completed);
    assert_eq!(mission.results[&first].attempts, 1);
    assert_eq!(llm.calls(), 3);

    let record = corp.queue.record(&first).expect("task record should exist");
    assert_eq!(record.task.priority, Priority::Critical);
    assert_eq!(record.task.mission_id.as_deref(), Some(mission_id.as_str()));
    assert_eq!(corp.queue.records_for_mission(&mission_id).len(), 2);
    assert_eq!(corp.ceo.list_missions().await.len(), 1);
}

#[tokio::test]
async fn mission_fails_when_a_task_fails() {
    let plan = json!({
        "tasks": [{"id": "task_1", "type": "general", "description": "Do the thing", "complexity": 0.2}]
    })
    .to_string();
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok(plan.as_str())], None);
    let corp = corp_with(llm.clone());
    corp.start().await;

    let mission_id = corp
        .ceo
        .receive_mission("Do the thing well", None, Priority::Medium)
        .await
        .expect("mission should be accepted");
    let mission = corp
        .ceo
        .wait_for_mission(&mission_id, Duration::from_secs(10))
        .await
        .expect("mission should finish");
    corp.shutdown().await.expect("shutdown should succeed");

    assert_eq!(mission.status, MissionStatus::Failed);
    let outcome = &mission.results[&format!("{mission_id}_task_1")];
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("scripted backend"));
    // One planning call plus one per attempt.
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn mission_waits_for_every_task_before_failing() {
    let plan = json!({
        "tasks": [
            {"id": "task_1", "type": "general", "description": "First part", "complexity": 0.2},
            {"id": "task_2", "type": "general", "description": "Second part", "complexity": 0.2}
        ]
    })
    .to_string();
    // One task gets the only answer, the other exhausts its retries.
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok(plan.as_str()), Ok("done")], None);
    let corp = corp_with(llm.clone());
    corp.start().await;

    let mission_id = corp
        .ceo
        .receive_mission("Do both parts", None, Priority::Medium)
        .await
        .expect("mission should be accepted");
    let mission = corp
        .ceo
        .wait_for_mission(&mission_id, Duration::from_secs(10))
        .await
        .expect("mission should finish");
    corp.shutdown().await.expect("shutdown should succeed");

    assert_eq!(mission.status, MissionStatus::Failed);
    assert_eq!(mission.results.len(), 2);
    let completed = mission
        .results
        .values()
        .filter(|outcome| outcome.status == TaskStatus::Completed)
        .count();
    assert_eq!(completed, 1);
    let failed = mission
        .results
        .values()
        .find(|outcome| outcome.status == TaskStatus::Failed)
        .expect("one task should fail");
    assert_eq!(failed.attempts, 2);
    assert!(mission.completed_at.is_some());
    // Planning, the successful task and both attempts of the failing one.
    assert_eq!(llm.calls(), 4);
}

#[tokio::test]
async fn missions_are_listed_newest_first() {
    let corp = corp_with(ScriptedLlm::answering(Backend::Ollama, "not a plan"));
    let first = corp
        .ceo
        .receive_mission("First mission text", None, Priority::Low)
        .await
        .expect("first mission");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = corp
        .ceo
        .receive_mission("Second mission text", None, Priority::Low)
        .await
        .expect("second mission");

    let listed = corp
        .ceo
        .list_missions()
        .await
        .into_iter()
        .map(|mission| mission.id)
        .collect::<Vec<_>>();
    assert_eq!(listed, vec![second, first]);
    assert!(corp.ceo.get_mission("mission_missing").await.is_none());
    assert_eq!(corp.ceo.mission_count().await, 2);
}

#[tokio::test]
async fn registry_routes_by_task_type_and_rejects_failed_results() {
    let cfg = base_cfg();
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, "ok")));
    let registry = AgentRegistry::new(Arc::new(GeneralAgent::new(router.clone())))
        .register(Arc::new(ContentAgent::new(
            router.clone(),
            Arc::new(StaticPages::default()),
        )))
        .register(Arc::new(DevOpsAgent::new(router.clone())));

    assert_eq!(registry.route("article").name(), "content");
    assert_eq!(registry.route("translation").name(), "content");
    assert_eq!(registry.route("deploy").name(), "devops");
    assert_eq!(registry.route("planning").name(), "general");
    assert_eq!(registry.names(), vec!["content", "devops", "general"]);

    let empty = Task::new("blank", "general", Priority::Low, 0.1, json!({}));
    let err = registry
        .handle(&empty)
        .await
        .expect_err("missing description should fail");
    assert!(err.to_string().contains("agent 'general' failed task 'blank'"));

    let ok = Task::new("hi", "general", Priority::Low, 0.1, json!({"description": "Say hi"}));
    let value = registry.handle(&ok).await.expect("general agent should answer");
    assert_eq!(value["success"], true);
    assert_eq!(value["data"]["text"], "ok");
    assert_eq!(registry.stats().last().map(|stats| stats.tasks_completed), Some(1));
}

#[tokio::test]
async fn content_agent_builds_article_from_fallback_structure() {
    let cfg = base_cfg();
    let llm = ScriptedLlm::new(
        Backend::Ollama,
        vec![Ok("Sorry, no outline.")],
        Some("Solar panels lower bills. Panels need sun."),
    );
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, Arc::new(StaticPages::default()))
        .with_section_retry(RetryPolicy::new(1, Duration::ZERO));
    let request = ArticleRequest {
        topic: "solar panels".to_string(),
        keywords: vec!["solar".to_string(), "panels".to_string()],
        target_length: 800,
        language: "en".to_string(),
        style: "casual".to_string(),
    };

    let result = agent.generate_article(&request).await.expect("article should generate");
    assert!(result.success);
    let content = result.data["content"].as_str().expect("content should be a string");
    assert!(content.starts_with("# Everything about solar panels\n\n"));
    assert!(content.contains("## What is solar panels"));
    assert!(content.ends_with("---\n**Keywords:** solar, panels"));
    assert_eq!(result.data["sections"], 3);
    // Outline + intro + 3 sections + conclusion.
    assert_eq!(llm.calls(), 6);
    assert_eq!(agent.cached_structures(), 0);
    assert_eq!(result.tokens_used, 6 * 30);
}

#[tokio::test]
async fn content_agent_caches_model_outline() {
    let cfg = base_cfg();
    let outline = json!({
        "title": "Solar at home",
        "introduction": "Why solar",
        "sections": [{"heading": "Costs", "keywords": ["solar"], "bullet_points": ["install"]}],
        "conclusion": "Wrap up"
    })
    .to_string();
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok(outline.as_str())], Some("Body text."));
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, Arc::new(StaticPages::default()));
    let request = ArticleRequest {
        topic: "solar at home".to_string(),
        keywords: vec!["solar".to_string()],
        target_length: 500,
        language: "en".to_string(),
        style: "professional".to_string(),
    };

    let first = agent.generate_article(&request).await.expect("first article");
    assert_eq!(first.data["title"], "Solar at home");
    assert_eq!(agent.cached_structures(), 1);
    let calls_after_first = llm.calls();

    let second = agent.generate_article(&request).await.expect("second article");
    assert_eq!(second.data["title"], "Solar at home");
    // The cached outline skips one model call.
    assert_eq!(llm.calls() - calls_after_first, calls_after_first - 1);
}

#[tokio::test]
async fn content_agent_spends_target_length_and_raises_thin_keywords() {
    let cfg = base_cfg();
    let sentence = "Energy matters at home. ".repeat(15);
    let llm = ScriptedLlm::new(Backend::Ollama, vec![Ok("no outline")], Some(sentence.trim()));
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, Arc::new(StaticPages::default()));
    let request = ArticleRequest {
        topic: "home energy".to_string(),
        keywords: vec!["geothermal".to_string()],
        target_length: 100,
        language: "en".to_string(),
        style: "professional".to_string(),
    };

    let result = agent.generate_article(&request).await.expect("article should generate");
    assert!(result.success);
    // Outline + intro + 3 sections + conclusion + keyword sentences.
    assert_eq!(llm.calls(), 7);
    let content = result.data["content"].as_str().expect("content should be a string");
    assert!(content.contains("[... continued ...]"));
    assert!(content.ends_with("---\n**Keywords:** geothermal"));
    let body = content
        .split("\n\n[... continued ...]")
        .next()
        .expect("body before the marker");
    assert!(count_words(body) <= 100);
    assert!(body.ends_with('.'));
    assert_eq!(result.data["meta"]["title"], "Everything about home energy");
    assert_eq!(result.data["meta"]["keywords"], json!(["geothermal"]));
}

#[tokio::test]
async fn content_agent_keeps_article_when_keyword_pass_fails() {
    let cfg = base_cfg();
    let reply = "Heating costs vary.";
    let llm = ScriptedLlm::new(
        Backend::Ollama,
        vec![Ok("no outline"), Ok(reply), Ok(reply), Ok(reply), Ok(reply), Ok(reply)],
        None,
    );
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, Arc::new(StaticPages::default()));
    let request = ArticleRequest {
        topic: "home energy".to_string(),
        keywords: vec!["geothermal".to_string()],
        target_length: 2000,
        language: "en".to_string(),
        style: "professional".to_string(),
    };

    let result = agent.generate_article(&request).await.expect("article should generate");
    assert!(result.success);
    assert_eq!(llm.calls(), 7);
    let content = result.data["content"].as_str().expect("content should be a string");
    assert!(!content.contains("[... continued ...]"));
    assert_eq!(content.matches(reply).count(), 5);
}

#[tokio::test]
async fn content_agent_summarizes_pages_and_caches_summaries() {
    let cfg = base_cfg();
    let article = format!(
        "<html><body><nav>Home | About</nav><article><h1>Heat pumps</h1><p>{}</p>\
         <script>track()</script></article><footer>Contact</footer></body></html>",
        "Heat pumps move heat instead of making it. ".repeat(4)
    );
    let pages = StaticPages::with(&[("https://example.com/heat", article.as_str())]);
    let llm = ScriptedLlm::answering(Backend::Ollama, "- Heat pumps move heat");
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, pages.clone());
    let request = SummarizeRequest {
        urls: vec![
            "https://example.com/heat".to_string(),
            "https://example.com/missing".to_string(),
        ],
        max_length: 100,
    };

    let result = agent.summarize_pages(&request).await.expect("summarize should run");
    assert!(result.success);
    assert_eq!(result.data["summarized"], 1);
    let found = &result.data["pages"][0];
    assert_eq!(found["status"], "success");
    assert_eq!(found["summary"], "- Heat pumps move heat");
    assert!(found["original_length"].as_u64().unwrap_or_default() > 50);
    let missing = &result.data["pages"][1];
    assert_eq!(missing["status"], "error");
    assert!(missing["error"].as_str().unwrap_or_default().contains("HTTP 404"));
    assert_eq!(llm.calls(), 1);

    // Same page through the task path: fetched again, summary from cache.
    let task = Task::new(
        "sum",
        "research",
        Priority::Low,
        0.4,
        json!({ "url": "https://example.com/heat", "max_length": 100 }),
    );
    let again = agent.execute(&task).await.expect("summarize task should run");
    assert!(again.success);
    assert_eq!(again.data["summarized"], 1);
    assert_eq!(llm.calls(), 1);
    assert_eq!(pages.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn content_agent_rejects_unusable_summary_requests() {
    let cfg = base_cfg();
    let pages = StaticPages::with(&[("https://example.com/tiny", "<p>Too short.</p>")]);
    let llm = ScriptedLlm::answering(Backend::Ollama, "unused");
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, pages.clone());

    let blocked = SummarizeRequest {
        urls: vec!["javascript:alert(1)".to_string()],
        max_length: 500,
    };
    let result = agent.summarize_pages(&blocked).await.expect("validation is not an error");
    assert!(!result.success);
    assert_eq!(pages.fetches.load(Ordering::SeqCst), 0);

    let tiny = SummarizeRequest {
        urls: vec!["https://example.com/tiny".to_string()],
        max_length: 500,
    };
    let result = agent.summarize_pages(&tiny).await.expect("summarize should run");
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("no usable text"));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn content_agent_translates_text() {
    let cfg = base_cfg();
    let llm = ScriptedLlm::answering(Backend::Ollama, "  Hallo Welt  ");
    let router = router_with(&cfg, local_only(llm.clone()));
    let agent = ContentAgent::new(router, Arc::new(StaticPages::default()));

    let task = Task::new(
        "tr",
        "translation",
        Priority::Low,
        0.4,
        json!({ "text": "Hello world", "target_language": "de", "source_language": "en" }),
    );
    let result = agent.execute(&task).await.expect("translation should run");
    assert!(result.success);
    assert_eq!(result.data["translation"], "Hallo Welt");
    assert_eq!(result.data["target_language"], "de");
    assert_eq!(result.data["source_language"], "en");

    let unsupported = TranslationRequest {
        text: "Hello".to_string(),
        target_language: "xx".to_string(),
        source_language: None,
    };
    let result = agent.translate(&unsupported).await.expect("validation is not an error");
    assert!(!result.success);
    assert_eq!(llm.calls(), 1);
}

#[test]
fn section_budgets_follow_target_length() {
    assert_eq!(section_word_budgets(2000, 3), (200, 533));
    assert_eq!(section_word_budgets(5000, 4), (500, 1000));
    // Short targets still get usable sections.
    assert_eq!(section_word_budgets(100, 5), (50, 50));
    assert_eq!(section_word_budgets(800, 0), (80, 640));
}

#[test]
fn truncate_to_words_cuts_at_sentence_end() {
    let text = "One two three. Four five six. Seven eight.";
    assert_eq!(
        truncate_to_words(text, 5),
        "One two three.\n\n[... continued ...]"
    );
    assert_eq!(truncate_to_words(text, 8), text);
    assert_eq!(
        truncate_to_words("no stops here at all", 2),
        "no stops\n\n[... continued ...]"
    );
}

#[test]
fn long_paragraphs_split_at_sentence_boundary() {
    let long = "First sentence is here. Second one follows. Third goes on. Fourth ends it.";
    let content = format!("## Heading that stays whole\n\n{long}\n\nShort one.");
    let split = split_long_paragraphs(&content, 40);
    assert_eq!(
        split,
        "## Heading that stays whole\n\nFirst sentence is here. Second one follows.\n\n\
         Third goes on. Fourth ends it.\n\nShort one."
    );
    assert_eq!(split_long_paragraphs("No boundary in this paragraph", 5), "No boundary in this paragraph");
}

#[test]
fn extra_sentences_land_after_first_paragraph() {
    let content = "# Title\n\nIntro.\n\n## Part\n\nBody.";
    assert_eq!(
        insert_after_first_paragraph(content, "  Extra line.  "),
        "# Title\n\nIntro.\n\nExtra line.\n\n## Part\n\nBody."
    );
    assert_eq!(insert_after_first_paragraph(content, "   "), content);
    assert_eq!(insert_after_first_paragraph("# Only", "Extra."), "# Only\n\nExtra.");
}

#[test]
fn meta_description_skips_headings_and_caps_length() {
    let keywords = vec!["solar".to_string()];
    let meta = build_meta("Solar guide", "# Solar guide\n\nShort intro.\n\n## Part\n\nMore text.", &keywords);
    assert_eq!(meta.title, "Solar guide");
    assert_eq!(meta.description, "Short intro. More text.");
    assert_eq!(meta.keywords, keywords);

    let body = "word ".repeat(100);
    let meta = build_meta(&"T".repeat(80), &body, &keywords);
    assert_eq!(meta.title.chars().count(), 60);
    assert!(meta.description.ends_with("..."));
    assert!(meta.description.chars().count() <= 163);
}

#[test]
fn html_cleaning_keeps_main_content_only() {
    let html = "<html><head><style>p{}</style></head><body><header>Site</header>\
                <main><h2>Title</h2><p>Read   more at https://example.com/x today.</p>\
                <script>alert(1)</script><p>Second.</p></main><footer>Foot</footer></body></html>";
    let text = clean_html(html).expect("html should convert");
    assert!(text.contains("Title"));
    assert!(text.contains("Read more at today."));
    assert!(text.contains("Second."));
    assert!(!text.contains("alert"));
    assert!(!text.contains("Site"));
    assert!(!text.contains("Foot"));
    assert!(!text.contains("https://"));
}

#[test]
fn post_process_collapses_blank_runs_and_truncates() {
    assert_eq!(post_process("a  b\n\n\n\nc   \n"), "a b\n\nc");
    let long = "x".repeat(MAX_PAGE_CHARS + 10);
    let cut = post_process(&long);
    assert!(cut.starts_with(&"x".repeat(MAX_PAGE_CHARS)));
    assert!(cut.ends_with("[... text truncated ...]"));
}

#[tokio::test]
async fn devops_agent_extracts_code_and_generates_tests() {
    let cfg = base_cfg();
    let reply = "```python\ndef add(a, b):\n    return a + b\n```\nAdds two numbers.";
    let router = router_with(&cfg, local_only(ScriptedLlm::answering(Backend::Ollama, reply)));
    let agent = DevOpsAgent::new(router);
    let request = CodeRequest {
        specification: "Add two numbers together".to_string(),
        language: "python".to_string(),
        framework: None,
        include_tests: true,
    };

    let result = agent.generate_code(&request).await.expect("code should generate");
    assert_eq!(result.data["code"], "def add(a, b):\n    return a + b");
    assert_eq!(result.data["explanation"], "Adds two numbers.");
    assert_eq!(result.data["tests"], "def add(a, b):\n    return a + b");
    assert_eq!(result.data["analysis"]["functions"], 1);
    assert_eq!(agent.stats().tasks_completed, 1);
}

#[test]
fn extract_code_block_prefers_matching_language() {
    let text = "Setup:\n```bash\npip install x\n```\nCode:\n```python\nprint('hi')\n```\nDone.";
    let (code, explanation) = extract_code_block(text, "python");
    assert_eq!(code, "print('hi')");
    assert_eq!(explanation, "Done.");

    let (code, _) = extract_code_block(text, "rust");
    assert_eq!(code, "pip install x");

    let (code, explanation) = extract_code_block("  plain reply  ", "go");
    assert_eq!(code, "plain reply");
    assert!(explanation.is_empty());
}

#[test]
fn analyze_code_counts_lines_functions_and_markers() {
    let code = "def a():\n    pass\n\nasync def b():\n    # TODO: handle errors\n    pass\n";
    let analysis = analyze_code(code);
    assert_eq!(analysis.lines, 6);
    assert_eq!(analysis.non_empty_lines, 5);
    assert_eq!(analysis.functions, 2);
    assert_eq!(analysis.todo_markers, 1);
}

#[test]
fn seo_analysis_reports_density_and_headings() {
    let keywords = vec!["solar".to_string(), "heat pump".to_string()];
    let body = assemble_body(
        "Solar guide",
        "Solar power is cheap.",
        &[("Heat pump basics".to_string(), "A heat pump moves heat.".to_string())],
        "Go solar.",
    );
    let content = format!("{body}\n\n{}", keyword_footer(&keywords));
    let report = analyze_seo(&content, &keywords);
    assert_eq!(report.total_words, count_words(&content));
    assert_eq!(report.headings_count, 3);
    assert_eq!(report.keyword_stats["solar"].count, 4);
    assert_eq!(report.keyword_stats["heat pump"].count, 3);
    assert!(report.keyword_stats["solar"].needs_optimization);
    assert!(report.readability_score > 0.0 && report.readability_score <= 100.0);
}

#[test]
fn readability_score_penalizes_long_words_and_sentences() {
    assert_eq!(readability_score(""), 100.0);
    let short = readability_score("It is hot. We go out. Sun is up.");
    let long = readability_score(
        "Comprehensive photovoltaic installations necessitate meticulous structural considerations \
         alongside regulatory documentation requirements and interconnection agreements",
    );
    assert!(short > long);
    assert!((0.0..=100.0).contains(&long));
}

#[test]
fn fallback_structure_spreads_keywords_across_sections() {
    let keywords = ["a1", "b2", "c3", "d4", "e5"].map(str::to_string).to_vec();
    let structure = fallback_structure("gardening", &keywords);
    assert_eq!(structure.sections.len(), 3);
    assert_eq!(structure.sections[0].keywords, vec!["a1", "b2"]);
    assert_eq!(structure.sections[1].keywords, vec!["c3", "d4"]);
    assert_eq!(structure.sections[2].keywords, vec!["d4", "e5"]);
}

#[test]
fn mission_request_validation() {
    let request = |description: &str, priority: &str| MissionRequest {
        description: description.to_string(),
        priority: priority.to_string(),
        user_id: Some("  ".to_string()),
    };

    let valid = validate_mission_request(&request("  Write a report  ", "HIGH"))
        .expect("valid mission");
    assert_eq!(valid.description, "Write a report");
    assert_eq!(valid.priority, Priority::High);
    assert_eq!(valid.user_id, None);

    assert_eq!(
        validate_mission_request(&request("hi", "low")),
        Err(ValidationError::TooShort {
            field: "description",
            min: 5
        })
    );
    assert_eq!(
        validate_mission_request(&request("list files; rm -rf /", "low")),
        Err(ValidationError::ForbiddenCharacters {
            field: "description"
        })
    );
    assert!(matches!(
        validate_mission_request(&request("Write a report", "urgent")),
        Err(ValidationError::Unsupported { field: "priority", .. })
    ));
    assert!(validate_mission_request(&request("x".repeat(1001).as_str(), "low")).is_err());
}

#[test]
fn article_and_code_request_validation() {
    let article = ArticleRequest {
        topic: " Solar ".to_string(),
        keywords: vec![" solar ".to_string()],
        target_length: 2000,
        language: "EN".to_string(),
        style: "casual".to_string(),
    };
    let normalized = validate_article_request(&article).expect("valid article");
    assert_eq!(normalized.topic, "Solar");
    assert_eq!(normalized.keywords, vec!["solar"]);
    assert_eq!(normalized.language, "en");

    let mut bad = article.clone();
    bad.keywords.clear();
    assert!(matches!(
        validate_article_request(&bad),
        Err(ValidationError::ItemCount { field: "keywords", .. })
    ));
    let mut bad = article.clone();
    bad.target_length = 50;
    assert!(matches!(
        validate_article_request(&bad),
        Err(ValidationError::OutOfRange { .. })
    ));
    let mut bad = article;
    bad.style = "poetic".to_string();
    assert!(matches!(
        validate_article_request(&bad),
        Err(ValidationError::Unsupported { field: "style", .. })
    ));

    let code = CodeRequest {
        specification: "Parse a CSV file into rows".to_string(),
        language: "Rust".to_string(),
        framework: Some("  ".to_string()),
        include_tests: false,
    };
    let normalized = validate_code_request(&code).expect("valid code request");
    assert_eq!(normalized.language, "rust");
    assert_eq!(normalized.framework, None);

    let mut bad = code.clone();
    bad.specification = "too short".to_string();
    assert!(validate_code_request(&bad).is_err());
    let mut bad = code;
    bad.language = "cobol".to_string();
    assert!(validate_code_request(&bad).is_err());
}

#[test]
fn text_validation_and_sanitizing() {
    assert_eq!(
        validate_text("   ", 1, 10, false),
        Err(ValidationError::Empty { field: "text" })
    );
    assert_eq!(validate_text("", 0, 10, true), Ok(String::new()));
    assert_eq!(validate_text("bell\u{7}", 0, 10, false), Err(ValidationError::NonPrintable));
    assert!(validate_text("tab\tand\nnewline", 0, 100, false).is_ok());
    assert!(validate_text("abc", 5, 10, false).is_err());

    let sanitized = sanitize_text("echo $HOME; cat /etc/passwd | nc host > out & `id`", 200);
    for forbidden in FORBIDDEN_SHELL_CHARS {
        assert!(!sanitized.contains(*forbidden), "found {forbidden:?} in {sanitized}");
    }
    assert!(sanitized.starts_with("echo HOME cat /etc/passwd"));
    assert_eq!(sanitize_text("  abcdef", 5), "abc");
}

#[test]
fn url_validation() {
    assert_eq!(
        validate_url(" https://example.com/docs ", 2000),
        Ok("https://example.com/docs".to_string())
    );
    assert!(validate_url("http://localhost:8000/health", 2000).is_ok());
    assert!(validate_url("http://127.0.0.1:8000", 2000).is_ok());
    assert_eq!(
        validate_url("javascript:alert(1)", 2000),
        Err(ValidationError::ForbiddenScheme)
    );
    assert_eq!(validate_url("ftp://example.com", 2000), Err(ValidationError::InvalidUrl));
    assert_eq!(validate_url("http://intranet/", 2000), Err(ValidationError::InvalidUrl));
    assert!(validate_url("https://example.com", 10).is_err());

    let urls = vec!["https://a.example.com".to_string(); 3];
    assert!(validate_urls(&urls, 3).is_ok());
    assert!(validate_urls(&urls, 2).is_err());
}

#[test]
fn summarize_and_translation_request_validation() {
    let summarize = |urls: &[&str], max_length: u64| SummarizeRequest {
        urls: urls.iter().map(|url| url.to_string()).collect(),
        max_length,
    };
    let valid = validate_summarize_request(&summarize(&[" https://example.com/a "], 300))
        .expect("valid summarize request");
    assert_eq!(valid.urls, vec!["https://example.com/a"]);
    assert!(matches!(
        validate_summarize_request(&summarize(&[], 300)),
        Err(ValidationError::ItemCount { field: "urls", .. })
    ));
    assert!(matches!(
        validate_summarize_request(&summarize(&["https://example.com/a"; 11], 300)),
        Err(ValidationError::ItemCount { field: "urls", .. })
    ));
    assert!(matches!(
        validate_summarize_request(&summarize(&["https://example.com/a"], 10)),
        Err(ValidationError::OutOfRange { field: "max_length", .. })
    ));
    assert_eq!(
        validate_summarize_request(&summarize(&["data:text/html,hi"], 300)).map(|r| r.urls),
        Err(ValidationError::ForbiddenScheme)
    );

    let translation = |text: &str, target: &str, source: Option<&str>| TranslationRequest {
        text: text.to_string(),
        target_language: target.to_string(),
        source_language: source.map(str::to_string),
    };
    let valid = validate_translation_request(&translation("  Hello  ", "de", Some(" ")))
        .expect("valid translation request");
    assert_eq!(valid.text, "Hello");
    assert_eq!(valid.source_language, None);
    assert!(validate_translation_request(&translation("   ", "de", None)).is_err());
    assert!(matches!(
        validate_translation_request(&translation("Hello", "klingon", None)),
        Err(ValidationError::Unsupported { field: "target_language", .. })
    ));
    assert!(matches!(
        validate_translation_request(&translation("Hello", "de", Some("xx"))),
        Err(ValidationError::Unsupported { field: "source_language", .. })
    ));
}

#[test]
fn retry_policy_doubles_delay() {
    let policy = RetryPolicy::new(3, Duration::from_millis(100));
    assert_eq!(policy.delay_after(1), Duration::from_millis(100));
    assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
}

#[tokio::test]
async fn retry_with_backoff_stops_at_first_success_or_last_attempt() {
    let calls = AtomicUsize::new(0);
    let value = retry_with_backoff(RetryPolicy::new(3, Duration::ZERO), "flaky op", |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Err(anyhow::anyhow!("attempt {attempt} failed"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await
    .expect("third attempt should succeed");
    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = retry_with_backoff(RetryPolicy::new(2, Duration::ZERO), "broken op", |attempt| async move {
        Err::<(), _>(anyhow::anyhow!("attempt {attempt} failed"))
    })
    .await
    .expect_err("all attempts fail");
    assert_eq!(err.to_string(), "attempt 2 failed");

    let err = with_timeout(Duration::from_millis(10), "slow op", async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    })
    .await
    .expect_err("should time out");
    assert!(err.to_string().starts_with("slow op timed out"));
}

#[test]
fn ttl_cache_evicts_oldest_and_expires_entries() {
    let mut cache = TtlCache::new(2, None);
    cache.insert("a".to_string(), 1);
    cache.insert("b".to_string(), 2);
    cache.insert("c".to_string(), 3);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("c"), Some(3));
    cache.clear();
    assert!(cache.is_empty());

    let mut expiring = TtlCache::new(4, Some(Duration::from_millis(1)));
    expiring.insert("k".to_string(), "v".to_string());
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(expiring.get("k"), None);
    assert!(expiring.is_empty());

    let key = cache_key(&["topic", "kw1,kw2", "casual"]);
    assert_eq!(key.len(), 32);
    assert_eq!(key, cache_key(&["topic", "kw1,kw2", "casual"]));
    assert_ne!(key, cache_key(&["topic", "kw1", "kw2,casual"]));
}

#[test]
fn error_taxonomy_distinguishes_categories() {
    let category = |msg: &str| categorize_error(&anyhow::anyhow!(msg.to_string()));
    assert_eq!(
        category("missing prerequisite tool(s): docker"),
        ErrorCategory::Deploy
    );
    assert_eq!(
        category("health check failed: 'http://x/health' did not return HTTP 200"),
        ErrorCategory::Deploy
    );
    assert_eq!(category("ollama model 'x' request failed"), ErrorCategory::Provider);
    assert_eq!(
        category("invalid value: max_retries must be positive"),
        ErrorCategory::Input
    );
    assert_eq!(category("invalid value: compose_command 'x'"), ErrorCategory::Deploy);
    assert_eq!(
        category("task 'x' already exists in the queue"),
        ErrorCategory::Queue
    );
    assert_eq!(category("something odd"), ErrorCategory::Internal);
}

#[test]
fn cli_errors_redact_connection_strings_unless_requested() {
    let err = anyhow::anyhow!("cannot open postgres://admin:hunter2@db:5432/app (refused)");
    let redacted = format_cli_error(&err, false);
    assert!(redacted.starts_with("[INTERNAL] "));
    assert!(redacted.contains("postgres://[REDACTED]"));
    assert!(!redacted.contains("hunter2"));
    assert!(redacted.contains("\nHint: "));

    let revealed = format_cli_error(&err, true);
    assert!(revealed.contains("hunter2"));

    assert_eq!(
        redact_connection_url_value("sqlite:///./data/ai_corp.db"),
        "sqlite://[REDACTED]"
    );
    assert_eq!(
        redact_sensitive_text("url=redis://:pw@cache:6379 ok"),
        "url=redis://[REDACTED] ok"
    );
}

#[test]
fn runtime_config_defaults_without_config_file() {
    let cli = test_cli("does/not/exist.toml");
    let file = load_config_file(&cli.config_path).expect("missing file is not an error");
    assert!(file.is_none());

    let cfg = resolve_runtime_config(&cli, file).expect("defaults should resolve");
    assert!(!cfg.config_loaded);
    assert_eq!(cfg.max_concurrent_tasks, 3);
    assert_eq!(cfg.task_timeout_secs, 600);
    assert_eq!(cfg.max_retries, 3);
    assert_eq!(cfg.gpu_total_vram_gb, 24.0);
    assert_eq!(cfg.gpu_reserved_vram_gb, 2.0);
    assert_eq!(cfg.gpu_max_models_loaded, 2);
    assert_eq!(cfg.server_host, "0.0.0.0");
    assert_eq!(cfg.server_port, 8000);
    assert_eq!(cfg.deploy_wait_secs, 30);
    assert_eq!(cfg.health_url, "http://localhost:8000/health");
    assert_eq!(cfg.telemetry_path, "logs/telemetry.jsonl");
    assert_eq!(cfg.required_tools, vec!["git", "python3", "curl"]);
    assert_eq!(cfg.models.len(), 5);
}

#[test]
fn runtime_config_layers_cli_over_file() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("ai-corp.toml");
    std::fs::write(
        &path,
        r#"
[queue]
max_concurrent_tasks = 5
max_retries = 0
task_timeout_secs = 90

[paths]
logs_dir = "var/log"

[models.local_small]
name = "llama3.1"
quantization = "8b"
vram_gb = 6.0
"#,
    )
    .expect("config should be written");
    let mut cli = test_cli(path.to_str().expect("utf-8 path"));
    cli.max_concurrent_tasks = Some(2);

    let file = load_config_file(&cli.config_path).expect("config should parse");
    let cfg = resolve_runtime_config(&cli, file).expect("config should resolve");
    assert!(cfg.config_loaded);
    assert_eq!(cfg.max_concurrent_tasks, 2);
    assert_eq!(cfg.max_retries, 1);
    assert_eq!(cfg.task_timeout_secs, 90);
    assert_eq!(cfg.telemetry_path, "var/log/telemetry.jsonl");
    assert_eq!(cfg.models[&ModelTier::LocalSmall].full_name(), "llama3.1:8b");
    assert_eq!(cfg.models[&ModelTier::LocalMedium].full_name(), "qwen2.5:14b");
}

#[test]
fn runtime_config_rejects_unknown_fields_and_tiers() {
    let dir = tempdir().expect("tempdir should be created");
    let typo = dir.path().join("typo.toml");
    std::fs::write(&typo, "[queue]\nmax_concurent_tasks = 2\n").expect("write");
    let err = load_config_file(typo.to_str().expect("utf-8 path")).expect_err("typo should fail");
    assert!(format!("{err:#}").contains("invalid configuration"));

    let tier = dir.path().join("tier.toml");
    std::fs::write(&tier, "[models.local_huge]\nname = \"big\"\n").expect("write");
    let cli = test_cli(tier.to_str().expect("utf-8 path"));
    let file = load_config_file(&cli.config_path).expect("shape is valid");
    let err = resolve_runtime_config(&cli, file).expect_err("unknown tier should fail");
    assert!(err.to_string().contains("unknown model tier 'local_huge'"));
}

#[test]
fn cli_parses_mission_command() {
    let cli = Cli::try_parse_from([
        "ai-corp",
        "--max-retries",
        "4",
        "mission",
        "--priority",
        "high",
        "Write",
        "three",
        "articles",
    ])
    .expect("mission command should parse");
    assert_eq!(cli.max_retries, Some(4));
    assert_eq!(command_label(&cli.command), "mission");
    match cli.command {
        Commands::Mission {
            description,
            priority,
            user_id,
        } => {
            assert_eq!(description.join(" "), "Write three articles");
            assert_eq!(priority, Priority::High);
            assert!(user_id.is_none());
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["ai-corp", "compose", "logs", "--follow"]).expect("compose logs");
    assert_eq!(command_label(&cli.command), "compose.logs");
    assert!(Cli::try_parse_from(["ai-corp", "mission"]).is_err());
}

#[cfg(unix)]
fn fake_tool(dir: &Path, name: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").expect("tool should be written");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("tool should be executable");
}

#[cfg(unix)]
#[test]
fn prerequisites_name_every_missing_tool() {
    let bin = tempdir().expect("tempdir should be created");
    fake_tool(bin.path(), "git");
    std::fs::write(bin.path().join("curl"), "not executable").expect("write");
    let path_env = bin.path().as_os_str();

    assert!(find_executable("git", Some(path_env)).is_some());
    assert!(find_executable("curl", Some(path_env)).is_none());
    check_prerequisites(&["git".to_string()], Some(path_env)).expect("git is present");

    let err = check_prerequisites(
        &["git".to_string(), "curl".to_string(), "python3".to_string()],
        Some(path_env),
    )
    .expect_err("missing tools should fail");
    assert!(err.to_string().contains("missing prerequisite tool(s): curl, python3"));
    assert!(check_prerequisites(&["git".to_string()], None).is_err());
}

#[test]
fn scaffold_creates_layout_and_never_overwrites_env() {
    let root = tempdir().expect("tempdir should be created");
    let report = scaffold_workspace(root.path()).expect("scaffold should succeed");
    for dir in WORKSPACE_DIRS {
        assert!(root.path().join(dir).is_dir(), "{dir} should exist");
    }
    assert!(report.created.contains(&"core/".to_string()));
    assert!(report.created.contains(&".env".to_string()));
    assert!(report.created.contains(&"tests/test_basic.py".to_string()));

    let env = std::fs::read_to_string(root.path().join(".env")).expect(".env should exist");
    assert!(env.contains("OPENAI_API_KEY="));
    assert!(env.contains("DATABASE_URL=sqlite:///./data/ai_corp.db"));
    let smoke = std::fs::read_to_string(root.path().join("tests/test_basic.py")).expect("smoke test");
    assert!(smoke.contains("/health"));

    let config_path = root.path().join("configs/ai-corp.toml");
    let config_path = config_path.to_str().expect("utf-8 path");
    let file = load_config_file(config_path).expect("template config should parse");
    assert!(file.is_some());
    let cfg = resolve_runtime_config(&test_cli(config_path), file)
        .expect("template config should resolve");
    assert!(cfg.config_loaded);
    assert_eq!(cfg.output_dir, "output");
    assert_eq!(cfg.logs_dir, "logs");

    std::fs::write(root.path().join(".env"), "OPENAI_API_KEY=sk-mine\n").expect("edit .env");
    let again = scaffold_workspace(root.path()).expect("second scaffold should succeed");
    assert!(again.created.is_empty());
    assert!(again.skipped.contains(&".env".to_string()));
    let env = std::fs::read_to_string(root.path().join(".env")).expect(".env should exist");
    assert_eq!(env, "OPENAI_API_KEY=sk-mine\n");
}

#[test]
fn config_rejects_removed_models_cache_dir() {
    let root = tempdir().expect("tempdir should be created");
    let path = root.path().join("ai-corp.toml");
    std::fs::write(&path, "[paths]\nmodels_cache_dir = \"models\"\n").expect("write config");
    let err = load_config_file(path.to_str().expect("utf-8 path"))
        .expect_err("unknown paths key should fail");
    assert!(format!("{err:#}").contains("models_cache_dir"));
}

#[tokio::test]
async fn setup_checks_prerequisites_before_touching_filesystem() {
    let root = tempdir().expect("tempdir should be created");
    let workspace = root.path().join("workspace");
    let mut cfg = base_cfg();
    cfg.required_tools = vec!["ai-corp-definitely-missing-tool".to_string()];

    let err = run_setup(&cfg, workspace.to_str().expect("utf-8 path"), false)
        .await
        .expect_err("missing tool should abort setup");
    assert!(err.to_string().contains("ai-corp-definitely-missing-tool"));
    assert!(!workspace.exists());
}

#[tokio::test]
async fn pull_configured_models_pulls_each_local_tier() {
    let cfg = base_cfg();
    let puller = FakePuller::default();
    let pulled = pull_configured_models(&cfg, &puller).await.expect("pulls should succeed");
    assert_eq!(pulled, 3);
    assert_eq!(puller.pulls.load(Ordering::SeqCst), 3);

    let failing = FakePuller {
        fail: true,
        ..FakePuller::default()
    };
    let err = pull_configured_models(&cfg, &failing)
        .await
        .expect_err("pull failure should stop setup");
    assert!(format!("{err:#}").contains("failed to pull model 'qwen2.5:7b'"));
}

#[tokio::test]
async fn health_check_reports_ok_only_for_http_200() {
    let app = axum::Router::new().route("/health", get(handle_health));
    let addr = serve_router(app).await;
    let timeout = Duration::from_secs(2);

    assert!(check_health(&format!("http://{addr}/health"), timeout).await.unwrap());
    assert!(!check_health(&format!("http://{addr}/missing"), timeout).await.unwrap());

    let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let closed_addr = closed.local_addr().expect("addr");
    drop(closed);
    assert!(!check_health(&format!("http://{closed_addr}/health"), timeout).await.unwrap());
}

#[test]
fn deploy_helpers_render_banner_and_compose_argv() {
    let banner = render_deploy_banner("http://localhost:8000/health", "http://localhost:8080");
    assert!(banner.contains("API:    http://localhost:8000\n"));
    assert!(banner.contains("Docs:   http://localhost:8000/docs\n"));
    assert!(banner.contains("Panel:  http://localhost:8080\n"));
    assert_eq!(api_base_from_health_url("http://h:1/health/"), "http://h:1");

    let mut cfg = base_cfg();
    assert_eq!(compose_argv(&cfg).expect("argv"), vec!["docker", "compose"]);
    cfg.compose_command = "docker-compose -f 'my stack.yml'".to_string();
    assert_eq!(
        compose_argv(&cfg).expect("argv"),
        vec!["docker-compose", "-f", "my stack.yml"]
    );
    cfg.compose_command = "'unterminated".to_string();
    assert!(compose_argv(&cfg).is_err());
    cfg.compose_command = "   ".to_string();
    assert!(compose_argv(&cfg).is_err());
}

#[test]
fn clean_requires_force_to_delete() {
    let root = tempdir().expect("tempdir should be created");
    let mut cfg = base_cfg();
    cfg.output_dir = root.path().join("output").display().to_string();
    cfg.logs_dir = root.path().join("logs").display().to_string();
    std::fs::create_dir_all(root.path().join("output/articles")).expect("mkdir");
    std::fs::write(root.path().join("output/articles/a.md"), "# a").expect("write");
    std::fs::create_dir_all(root.path().join("logs")).expect("mkdir");
    std::fs::write(root.path().join("logs/api.log"), "line").expect("write");

    assert_eq!(clean_targets(&cfg).expect("targets").len(), 2);
    assert_eq!(run_clean(&cfg, false).expect("dry run"), 0);
    assert!(root.path().join("logs/api.log").exists());

    assert_eq!(run_clean(&cfg, true).expect("clean"), 2);
    assert!(!root.path().join("logs/api.log").exists());
    assert!(!root.path().join("output/articles").exists());
    assert!(root.path().join("output").is_dir());
    assert_eq!(run_clean(&cfg, true).expect("nothing left"), 0);
}

#[tokio::test]
async fn api_serves_health_missions_and_status() {
    let state = server_state(None);
    let addr = serve_router(build_server_router(state)).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health request");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    let body: Value = health.json().await.expect("health json");
    assert_eq!(body["status"], "healthy");

    let missing = client
        .get(format!("http://{addr}/missions/mission_deadbeef"))
        .send()
        .await
        .expect("mission request");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.expect("error json");
    assert_eq!(body["error"], "Mission not found");

    let invalid = client
        .post(format!("http://{addr}/missions"))
        .json(&json!({ "description": "hey" }))
        .send()
        .await
        .expect("create request");
    assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

    for body in [json!({}), json!({ "priority": "high" })] {
        let incomplete = client
            .post(format!("http://{addr}/missions"))
            .json(&body)
            .send()
            .await
            .expect("create request");
        assert_eq!(incomplete.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = incomplete.json().await.expect("error json");
        assert!(body["error"].as_str().unwrap_or_default().contains("description"));
    }

    let malformed = client
        .post(format!("http://{addr}/content/articles"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .expect("article request");
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = malformed.json().await.expect("error json");
    assert!(body["error"].is_string());

    let rejected = [
        ("content/summarize", json!({ "urls": ["javascript:alert(1)"] })),
        ("content/summarize", json!({ "urls": [] })),
        ("content/translate", json!({ "text": "Hello", "target_language": "klingon" })),
    ];
    for (path, payload) in rejected {
        let response = client
            .post(format!("http://{addr}/{path}"))
            .json(&payload)
            .send()
            .await
            .expect("content request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{path}");
        let body: Value = response.json().await.expect("error json");
        assert!(body["error"].is_string());
    }

    let status: Value = client
        .get(format!("http://{addr}/api/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["status"], "operational");
    assert_eq!(status["queue"]["max_concurrent"], 3);

    let fetched = fetch_status(&format!("http://{addr}/"), Duration::from_secs(2))
        .await
        .expect("status command should parse the endpoint");
    assert_eq!(fetched["status"], "operational");
}

#[tokio::test]
async fn create_mission_handler_accepts_valid_request() {
    let state = server_state(None);
    let accepted = handle_create_mission(
        State(state.clone()),
        HeaderMap::new(),
        Ok(axum::Json(MissionRequest {
            description: "Write a short product announcement".to_string(),
            priority: "high".to_string(),
            user_id: None,
        })),
    )
    .await
    .expect("mission should be accepted")
    .0;
    assert_eq!(accepted.status, "accepted");
    assert_eq!(accepted.estimated_time, 3600.0);
    assert!(state.corp.ceo.get_mission(&accepted.mission_id).await.is_some());
}

#[tokio::test]
async fn mutating_routes_require_token_when_configured() {
    let state = server_state(Some("s3cret"));
    let err = handle_create_mission(
        State(state.clone()),
        HeaderMap::new(),
        Ok(axum::Json(MissionRequest {
            description: "Write a short product announcement".to_string(),
            priority: "medium".to_string(),
            user_id: None,
        })),
    )
    .await
    .expect_err("missing token should be rejected");
    assert_eq!(err.0, StatusCode::UNAUTHORIZED);

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        "Bearer s3cret".parse().expect("header value"),
    );
    assert!(check_server_auth(&state, &headers).is_ok());
    headers.insert(
        axum::http::header::AUTHORIZATION,
        "Bearer wrong".parse().expect("header value"),
    );
    assert!(check_server_auth(&state, &headers).is_err());
}

#[tokio::test]
async fn corporation_start_is_idempotent_and_shutdown_stops_dispatcher() {
    let corp = corp_with(ScriptedLlm::answering(Backend::Ollama, "ok"));
    corp.start().await;
    corp.start().await;
    corp.shutdown().await.expect("shutdown should succeed");
    corp.shutdown().await.expect("second shutdown is a no-op");
}

#[test]
fn telemetry_sink_writes_events_that_report_summarizes() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir.path().join("nested/telemetry.jsonl").display().to_string();

    let sink = TelemetrySink::new(&cfg, "mission".to_string());
    sink.emit("mission.accepted", json!({ "mission_id": "mission_1" }));
    sink.emit("task.retrying", json!({ "task_id": "t1", "attempt": 1 }));
    sink.emit("task.completed", json!({ "task_id": "t1" }));
    sink.emit("mission.completed", json!({ "mission_id": "mission_1" }));
    sink.emit("command.completed", json!({ "duration_ms": 5 }));

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry file");
    let mut lines = content.lines().map(str::to_string).collect::<Vec<_>>();
    lines.push("not json".to_string());
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 6);
    assert_eq!(summary.parsed_events, 5);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.unique_runs.len(), 1);
    assert_eq!(summary.command_counts.get("mission"), Some(&5));
    assert_eq!(summary.missions_accepted, 1);
    assert_eq!(summary.missions_completed, 1);
    assert_eq!(summary.tasks_completed, 1);
    assert_eq!(summary.tasks_retried, 1);
    assert_eq!(summary.command_completed, 1);
    assert_eq!(summary.top_commands(5), vec![("mission", 5)]);
    let report = render_telemetry_report(Path::new("telemetry.jsonl"), &summary);
    assert!(report.contains("Missions: accepted=1 completed=1 failed=0"));
    assert!(report.contains("- mission: 5"));

    let limited = summarize_telemetry_lines(
        vec!["{\"event\":\"task.failed\"}".to_string(); 4],
        2,
    );
    assert_eq!(limited.tasks_failed, 2);

    let disabled = TelemetrySink::disabled();
    assert!(!disabled.is_enabled());
    disabled.emit("task.failed", json!({}));
}
