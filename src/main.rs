use std::sync::Arc;
use std::time::Duration;

use ai_corp::agents::ceo::MissionStatus;
use ai_corp::app::Corporation;
use ai_corp::cli::{Cli, Commands, ModelCommands, Priority, TelemetryCommands, command_label};
use ai_corp::config::{RuntimeConfig, load_config_file, resolve_runtime_config};
use ai_corp::deploy::{run_clean, run_compose_command, run_deploy, run_status};
use ai_corp::doctor::{run_doctor, run_models_list};
use ai_corp::error::{categorize_error, format_cli_error};
use ai_corp::server::run_server;
use ai_corp::setup::{run_pull_models, run_setup};
use ai_corp::telemetry::{TelemetrySink, run_telemetry_report};
use ai_corp::validators::{MissionRequest, validate_mission_request};
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::level_filters::LevelFilter;

/// Extra time granted past the mission timeout so the final status lands.
const MISSION_WAIT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` feeds the clap `env` fallbacks, so it must load before parsing.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let file = load_config_file(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, file)?;
    let command = command_label(&cli.command);
    let telemetry = TelemetrySink::new(&cfg, command);
    let started = std::time::Instant::now();

    let result = dispatch(cli.command, &cfg, &telemetry).await;
    let duration_ms = started.elapsed().as_millis();
    match &result {
        Ok(()) => telemetry.emit(
            "command.completed",
            json!({ "duration_ms": duration_ms }),
        ),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "duration_ms": duration_ms,
                "category": categorize_error(err).code()
            }),
        ),
    }
    result
}

async fn dispatch(command: Commands, cfg: &RuntimeConfig, telemetry: &TelemetrySink) -> Result<()> {
    match command {
        Commands::Setup { dir, pull_models } => {
            run_setup(cfg, &dir, pull_models).await?;
        }
        Commands::Deploy {
            wait_secs,
            health_url,
        } => {
            run_deploy(cfg, wait_secs, health_url).await?;
        }
        Commands::Compose { command } => {
            run_compose_command(cfg, command).await?;
        }
        Commands::Status { api_url } => {
            run_status(&api_url).await?;
        }
        Commands::PullModels => {
            run_pull_models(cfg).await?;
        }
        Commands::Clean { force } => {
            run_clean(cfg, force)?;
        }
        Commands::Doctor => {
            run_doctor(cfg)?;
        }
        Commands::Models { command } => match command {
            ModelCommands::List => run_models_list(cfg)?,
        },
        Commands::Mission {
            description,
            priority,
            user_id,
        } => {
            run_mission(cfg, telemetry, &description.join(" "), priority, user_id).await?;
        }
        Commands::Serve { host, port } => {
            let corp = Arc::new(Corporation::initialize(cfg.clone(), telemetry.clone())?);
            let host = host.unwrap_or_else(|| cfg.server_host.clone());
            let port = port.unwrap_or(cfg.server_port);
            tracing::info!(host = %host, port, "starting API server");
            run_server(corp, host, port, telemetry).await?;
        }
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit)?,
        },
    }

    Ok(())
}

async fn run_mission(
    cfg: &RuntimeConfig,
    telemetry: &TelemetrySink,
    description: &str,
    priority: Priority,
    user_id: Option<String>,
) -> Result<()> {
    let request = MissionRequest {
        description: description.to_string(),
        priority: priority.label().to_string(),
        user_id,
    };
    let mission = validate_mission_request(&request)
        .context("mission request validation failed")?;

    let corp = Corporation::initialize(cfg.clone(), telemetry.clone())?;
    corp.start().await;
    let outcome = async {
        let mission_id = corp
            .ceo
            .receive_mission(&mission.description, mission.user_id, mission.priority)
            .await?;
        println!("Mission {mission_id} accepted, waiting for results...");
        let wait = Duration::from_secs(cfg.mission_timeout_secs) + MISSION_WAIT_GRACE;
        corp.ceo.wait_for_mission(&mission_id, wait).await
    }
    .await;
    corp.shutdown().await?;

    let finished = outcome?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    if finished.status != MissionStatus::Completed {
        return Err(anyhow::anyhow!(
            "mission '{}' finished with status {}",
            finished.id,
            finished.status.label()
        ));
    }
    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
