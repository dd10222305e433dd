use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Lenient parse used for model-produced plans; unknown values become `Medium`.
    pub fn parse_or_medium(value: &str) -> Priority {
        Priority::from_str(value.trim(), true).unwrap_or(Priority::Medium)
    }
}

#[derive(Debug, Subcommand)]
pub enum ComposeCommands {
    #[command(about = "Build and start the compose stack in the background")]
    Up,
    #[command(about = "Stop and remove the compose stack")]
    Down,
    #[command(about = "Follow compose service logs")]
    Logs {
        #[arg(long, default_value_t = false)]
        follow: bool,
        #[arg(long)]
        service: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelCommands {
    #[command(about = "List the model catalog and the tier chosen per complexity")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  ai-corp setup\n\
  ai-corp setup --pull-models\n\
  ai-corp deploy --wait-secs 30\n\
  ai-corp compose logs --follow --service api\n\
  ai-corp status --api-url http://localhost:8000\n\
  ai-corp serve --host 0.0.0.0 --port 8000\n\
  ai-corp mission --priority high \"Write three articles about home solar panels\"\n\
  ai-corp models list\n\
  ai-corp clean --force\n\
  ai-corp telemetry report --limit 2000";

#[derive(Debug, Parser)]
#[command(name = "ai-corp")]
#[command(about = "Multi-agent AI corporation: missions, task queue, model routing, and deploy tooling")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "AI_CORP_CONFIG", default_value = "configs/ai-corp.toml")]
    pub config_path: String,

    #[arg(long, env = "AI_CORP_OLLAMA_BASE_URL")]
    pub ollama_base_url: Option<String>,

    #[arg(long, env = "AI_CORP_MAX_CONCURRENT_TASKS")]
    pub max_concurrent_tasks: Option<usize>,

    #[arg(long, env = "AI_CORP_TASK_TIMEOUT_SECONDS")]
    pub task_timeout_secs: Option<u64>,

    #[arg(long, env = "AI_CORP_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "AI_CORP_GPU_TOTAL_VRAM_GB")]
    pub gpu_total_vram_gb: Option<f64>,

    #[arg(long, env = "AI_CORP_GPU_RESERVED_VRAM_GB")]
    pub gpu_reserved_vram_gb: Option<f64>,

    #[arg(long, env = "AI_CORP_GPU_MAX_MODELS_LOADED")]
    pub gpu_max_models_loaded: Option<usize>,

    #[arg(long, env = "AI_CORP_OUTPUT_DIR")]
    pub output_dir: Option<String>,

    #[arg(long, env = "AI_CORP_LOGS_DIR")]
    pub logs_dir: Option<String>,

    #[arg(long, env = "AI_CORP_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "AI_CORP_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "AI_CORP_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Check prerequisites and scaffold the workspace (.env, configs, dirs)")]
    Setup {
        #[arg(long, default_value = ".")]
        dir: String,
        #[arg(long, default_value_t = false)]
        pull_models: bool,
    },
    #[command(about = "Build and start containers, then verify the /health endpoint")]
    Deploy {
        #[arg(long)]
        wait_secs: Option<u64>,
        #[arg(long)]
        health_url: Option<String>,
    },
    #[command(about = "Docker Compose lifecycle helpers")]
    Compose {
        #[command(subcommand)]
        command: ComposeCommands,
    },
    #[command(about = "Query a running instance's /api/status endpoint")]
    Status {
        #[arg(long, env = "AI_CORP_API_URL", default_value = "http://localhost:8000")]
        api_url: String,
    },
    #[command(about = "Pull every configured local model through Ollama")]
    PullModels,
    #[command(about = "Remove generated output and logs (requires --force)")]
    Clean {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    #[command(about = "Validate provider environment, prerequisites, and resolved settings")]
    Doctor,
    #[command(about = "Inspect the model catalog and routing")]
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
    #[command(about = "Run a single mission in-process and print its results")]
    Mission {
        #[arg(required = true)]
        description: Vec<String>,
        #[arg(long, value_enum, default_value_t = Priority::Medium)]
        priority: Priority,
        #[arg(long)]
        user_id: Option<String>,
    },
    #[command(about = "Run the orchestration runtime with the HTTP API")]
    Serve {
        #[arg(long, env = "AI_CORP_HOST")]
        host: Option<String>,
        #[arg(long, env = "AI_CORP_PORT")]
        port: Option<u16>,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Setup { .. } => "setup".to_string(),
        Commands::Deploy { .. } => "deploy".to_string(),
        Commands::Compose { command } => match command {
            ComposeCommands::Up => "compose.up".to_string(),
            ComposeCommands::Down => "compose.down".to_string(),
            ComposeCommands::Logs { .. } => "compose.logs".to_string(),
        },
        Commands::Status { .. } => "status".to_string(),
        Commands::PullModels => "pull-models".to_string(),
        Commands::Clean { .. } => "clean".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Models { command } => match command {
            ModelCommands::List => "models.list".to_string(),
        },
        Commands::Mission { .. } => "mission".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
