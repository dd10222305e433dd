use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

pub const DEFAULT_REQUIRED_TOOLS: &[&str] = &["git", "python3", "curl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    LocalSmall,
    LocalMedium,
    LocalLarge,
    CloudClaude,
    CloudOpenai,
}

impl ModelTier {
    pub const LOCAL: [ModelTier; 3] = [
        ModelTier::LocalSmall,
        ModelTier::LocalMedium,
        ModelTier::LocalLarge,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ModelTier::LocalSmall => "local_small",
            ModelTier::LocalMedium => "local_medium",
            ModelTier::LocalLarge => "local_large",
            ModelTier::CloudClaude => "cloud_claude",
            ModelTier::CloudOpenai => "cloud_openai",
        }
    }

    pub fn parse(value: &str) -> Option<ModelTier> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local_small" => Some(ModelTier::LocalSmall),
            "local_medium" => Some(ModelTier::LocalMedium),
            "local_large" => Some(ModelTier::LocalLarge),
            "cloud_claude" => Some(ModelTier::CloudClaude),
            "cloud_openai" => Some(ModelTier::CloudOpenai),
            _ => None,
        }
    }

    pub fn is_local(self) -> bool {
        matches!(
            self,
            ModelTier::LocalSmall | ModelTier::LocalMedium | ModelTier::LocalLarge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub vram_gb: f64,
    #[serde(default = "default_quantization")]
    pub quantization: String,
    #[serde(default = "default_model_priority")]
    pub priority: u32,
    /// USD per 1k tokens; zero for local models.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

fn default_quantization() -> String {
    "latest".to_string()
}

fn default_model_priority() -> u32 {
    1
}

impl ModelSpec {
    pub fn full_name(&self) -> String {
        if self.name.contains(':') {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.quantization)
        }
    }
}

pub fn default_model_catalog() -> BTreeMap<ModelTier, ModelSpec> {
    let mut catalog = BTreeMap::new();
    catalog.insert(
        ModelTier::LocalSmall,
        ModelSpec {
            name: "qwen2.5".to_string(),
            vram_gb: 5.0,
            quantization: "7b".to_string(),
            priority: 3,
            cost_per_1k_tokens: 0.0,
        },
    );
    catalog.insert(
        ModelTier::LocalMedium,
        ModelSpec {
            name: "qwen2.5".to_string(),
            vram_gb: 10.0,
            quantization: "14b".to_string(),
            priority: 2,
            cost_per_1k_tokens: 0.0,
        },
    );
    catalog.insert(
        ModelTier::LocalLarge,
        ModelSpec {
            name: "qwen2.5".to_string(),
            vram_gb: 20.0,
            quantization: "32b".to_string(),
            priority: 1,
            cost_per_1k_tokens: 0.0,
        },
    );
    catalog.insert(
        ModelTier::CloudClaude,
        ModelSpec {
            name: "claude-sonnet-4-20250514".to_string(),
            vram_gb: 0.0,
            quantization: "latest".to_string(),
            priority: 1,
            cost_per_1k_tokens: 0.009,
        },
    );
    catalog.insert(
        ModelTier::CloudOpenai,
        ModelSpec {
            name: "gpt-4o-mini".to_string(),
            vram_gb: 0.0,
            quantization: "latest".to_string(),
            priority: 2,
            cost_per_1k_tokens: 0.0004,
        },
    );
    catalog
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub gpu: GpuSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub setup: SetupSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuSection {
    pub total_vram_gb: Option<f64>,
    pub reserved_vram_gb: Option<f64>,
    pub max_models_loaded: Option<usize>,
    pub load_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub mission_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterSection {
    pub ollama_base_url: Option<String>,
    pub cloud_threshold: Option<f64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploySection {
    pub compose_command: Option<String>,
    pub health_url: Option<String>,
    pub wait_secs: Option<u64>,
    pub panel_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupSection {
    pub required_tools: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    pub output_dir: Option<String>,
    pub logs_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: String,
    pub config_loaded: bool,
    pub ollama_base_url: String,
    pub cloud_threshold: f64,
    pub request_timeout_secs: u64,
    pub gpu_total_vram_gb: f64,
    pub gpu_reserved_vram_gb: f64,
    pub gpu_max_models_loaded: usize,
    pub model_load_timeout_secs: u64,
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub mission_timeout_secs: u64,
    pub server_host: String,
    pub server_port: u16,
    pub compose_command: String,
    pub health_url: String,
    pub deploy_wait_secs: u64,
    pub panel_url: String,
    pub required_tools: Vec<String>,
    pub output_dir: String,
    pub logs_dir: String,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub show_sensitive_config: bool,
    pub models: BTreeMap<ModelTier, ModelSpec>,
}

pub fn load_config_file(config_path: &str) -> Result<Option<ConfigFile>> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
    toml::from_str::<ConfigFile>(&content)
        .map(Some)
        .with_context(|| {
            format!(
                "invalid configuration in '{}'. Check section and field names.",
                path.display()
            )
        })
}

pub fn resolve_runtime_config(cli: &Cli, file: Option<ConfigFile>) -> Result<RuntimeConfig> {
    let config_loaded = file.is_some();
    let file = file.unwrap_or_default();

    let mut models = default_model_catalog();
    for (label, spec) in file.models {
        let tier = ModelTier::parse(&label).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid value: unknown model tier '{}' in '{}'. Supported: local_small, local_medium, local_large, cloud_claude, cloud_openai",
                label,
                cli.config_path
            )
        })?;
        if spec.name.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "model name for tier '{}' cannot be empty in '{}'",
                tier.label(),
                cli.config_path
            ));
        }
        models.insert(tier, spec);
    }

    let gpu_total_vram_gb = cli
        .gpu_total_vram_gb
        .or(file.gpu.total_vram_gb)
        .unwrap_or(24.0);
    let gpu_reserved_vram_gb = cli
        .gpu_reserved_vram_gb
        .or(file.gpu.reserved_vram_gb)
        .unwrap_or(2.0);
    if gpu_total_vram_gb < 0.0 || gpu_reserved_vram_gb < 0.0 {
        return Err(anyhow::anyhow!(
            "invalid value: VRAM settings must be non-negative (total={gpu_total_vram_gb}, reserved={gpu_reserved_vram_gb})"
        ));
    }

    let logs_dir = cli
        .logs_dir
        .clone()
        .or(file.paths.logs_dir)
        .unwrap_or_else(|| "logs".to_string());
    let telemetry_path = cli
        .telemetry_path
        .clone()
        .or(file.telemetry.path)
        .unwrap_or_else(|| format!("{}/telemetry.jsonl", logs_dir.trim_end_matches('/')));

    Ok(RuntimeConfig {
        config_path: cli.config_path.clone(),
        config_loaded,
        ollama_base_url: cli
            .ollama_base_url
            .clone()
            .or(file.router.ollama_base_url)
            .or_else(|| std::env::var("OLLAMA_HOST").ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| "http://localhost:11434".to_string()),
        cloud_threshold: file.router.cloud_threshold.unwrap_or(0.8).clamp(0.0, 1.0),
        request_timeout_secs: file.router.request_timeout_secs.unwrap_or(120).max(1),
        gpu_total_vram_gb,
        gpu_reserved_vram_gb,
        gpu_max_models_loaded: cli
            .gpu_max_models_loaded
            .or(file.gpu.max_models_loaded)
            .unwrap_or(2)
            .max(1),
        model_load_timeout_secs: file.gpu.load_timeout_secs.unwrap_or(600).max(1),
        max_concurrent_tasks: cli
            .max_concurrent_tasks
            .or(file.queue.max_concurrent_tasks)
            .unwrap_or(3)
            .max(1),
        task_timeout_secs: cli
            .task_timeout_secs
            .or(file.queue.task_timeout_secs)
            .unwrap_or(600)
            .max(1),
        max_retries: cli
            .max_retries
            .or(file.queue.max_retries)
            .unwrap_or(3)
            .max(1),
        retry_base_delay_ms: file.queue.retry_base_delay_ms.unwrap_or(1000),
        mission_timeout_secs: file.queue.mission_timeout_secs.unwrap_or(7200).max(1),
        server_host: file.server.host.unwrap_or_else(|| "0.0.0.0".to_string()),
        server_port: file.server.port.unwrap_or(8000),
        compose_command: file
            .deploy
            .compose_command
            .unwrap_or_else(|| "docker compose".to_string()),
        health_url: file
            .deploy
            .health_url
            .unwrap_or_else(|| "http://localhost:8000/health".to_string()),
        deploy_wait_secs: file.deploy.wait_secs.unwrap_or(30),
        panel_url: file
            .deploy
            .panel_url
            .unwrap_or_else(|| "http://localhost:8080".to_string()),
        required_tools: file.setup.required_tools.unwrap_or_else(|| {
            DEFAULT_REQUIRED_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect()
        }),
        output_dir: cli
            .output_dir
            .clone()
            .or(file.paths.output_dir)
            .unwrap_or_else(|| "output".to_string()),
        logs_dir,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(file.telemetry.enabled)
            .unwrap_or(true),
        telemetry_path,
        show_sensitive_config: cli.show_sensitive_config,
        models,
    })
}

pub fn anthropic_api_key() -> Option<String> {
    ["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

pub fn openai_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn display_database_url(cfg: &RuntimeConfig) -> String {
    match std::env::var("DATABASE_URL") {
        Ok(value) if !value.trim().is_empty() => {
            if cfg.show_sensitive_config {
                value
            } else {
                format!(
                    "{} (set --show-sensitive-config to reveal)",
                    crate::error::redact_connection_url_value(&value)
                )
            }
        }
        _ => "<not set>".to_string(),
    }
}
