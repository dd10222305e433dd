use anyhow::Result;

use crate::config::{RuntimeConfig, display_database_url};
use crate::provider::env_present;
use crate::router::ModelRouter;
use crate::setup::find_executable;

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Config: {} ({})",
        cfg.config_path,
        if cfg.config_loaded { "loaded" } else { "not found, using defaults" }
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("ANTHROPIC_API_KEY", env_present("ANTHROPIC_API_KEY")),
        ("CLAUDE_API_KEY", env_present("CLAUDE_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
        ("AI_CORP_API_TOKEN", env_present("AI_CORP_API_TOKEN")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }
    if !checks.iter().any(|(key, ok)| *ok && key.ends_with("_API_KEY")) {
        println!("Tip: without a cloud API key every task runs on local Ollama models.");
    }
    println!("DATABASE_URL: {}", display_database_url(cfg));

    let path_env = std::env::var_os("PATH");
    println!("Prerequisite tools:");
    let mut tools = cfg.required_tools.clone();
    for extra in ["docker", "ollama"] {
        if !tools.iter().any(|tool| tool == extra) {
            tools.push(extra.to_string());
        }
    }
    for tool in &tools {
        match find_executable(tool, path_env.as_deref()) {
            Some(path) => println!("- {tool}: {}", path.display()),
            None => println!("- {tool}: missing"),
        }
    }

    println!(
        "Queue: max_concurrent_tasks={} task_timeout_secs={} max_retries={} retry_base_delay_ms={} mission_timeout_secs={}",
        cfg.max_concurrent_tasks,
        cfg.task_timeout_secs,
        cfg.max_retries,
        cfg.retry_base_delay_ms,
        cfg.mission_timeout_secs
    );
    println!(
        "GPU: total_vram_gb={} reserved_vram_gb={} max_models_loaded={} load_timeout_secs={}",
        cfg.gpu_total_vram_gb,
        cfg.gpu_reserved_vram_gb,
        cfg.gpu_max_models_loaded,
        cfg.model_load_timeout_secs
    );
    println!(
        "Router: ollama_base_url={} cloud_threshold={} request_timeout_secs={}",
        cfg.ollama_base_url, cfg.cloud_threshold, cfg.request_timeout_secs
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    print_model_catalog(cfg);
    Ok(())
}

pub fn print_model_catalog(cfg: &RuntimeConfig) {
    println!("Model catalog:");
    for (tier, spec) in &cfg.models {
        let name = if tier.is_local() {
            spec.full_name()
        } else {
            spec.name.clone()
        };
        println!(
            "- {:<13} {:<28} vram_gb={:<5} cost_per_1k={}",
            tier.label(),
            name,
            spec.vram_gb,
            spec.cost_per_1k_tokens
        );
    }
}

/// `models list`: the catalog plus the local tier each complexity band maps to.
pub fn run_models_list(cfg: &RuntimeConfig) -> Result<()> {
    print_model_catalog(cfg);
    println!("Routing by complexity (before VRAM and cloud checks):");
    for complexity in [0.2, 0.5, 0.7] {
        println!(
            "- complexity {complexity:.1}: general={} code={}",
            ModelRouter::tier_for_complexity("general", complexity).label(),
            ModelRouter::tier_for_complexity("code", complexity).label()
        );
    }
    println!(
        "- complexity >= {:.2}: cloud (claude, then openai) when an API key is set",
        cfg.cloud_threshold
    );
    Ok(())
}
