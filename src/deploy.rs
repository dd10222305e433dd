use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cli::ComposeCommands;
use crate::config::RuntimeConfig;
use crate::setup::check_prerequisites;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

pub fn compose_argv(cfg: &RuntimeConfig) -> Result<Vec<String>> {
    let argv = shlex::split(&cfg.compose_command)
        .filter(|argv| !argv.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "invalid value: compose_command '{}' could not be parsed",
                cfg.compose_command
            )
        })?;
    Ok(argv)
}

pub async fn run_compose(cfg: &RuntimeConfig, args: &[&str]) -> Result<()> {
    let argv = compose_argv(cfg)?;
    let rendered = format!("{} {}", argv.join(" "), args.join(" "));
    tracing::info!(command = %rendered, "running compose");
    let status = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to launch '{rendered}'"))?;
    if !status.success() {
        return Err(anyhow::anyhow!("'{rendered}' failed with {status}"));
    }
    Ok(())
}

/// `Ok(false)` for any non-200 answer or an unreachable endpoint.
pub async fn check_health(url: &str, timeout: Duration) -> Result<bool> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client for health check")?;
    match client.get(url).send().await {
        Ok(response) => {
            let healthy = response.status() == reqwest::StatusCode::OK;
            tracing::debug!(url, status = response.status().as_u16(), healthy, "health check response");
            Ok(healthy)
        }
        Err(err) => {
            tracing::debug!(url, error = %err, "health check request failed");
            Ok(false)
        }
    }
}

pub fn api_base_from_health_url(health_url: &str) -> String {
    health_url
        .trim_end_matches('/')
        .trim_end_matches("/health")
        .to_string()
}

pub fn render_deploy_banner(health_url: &str, panel_url: &str) -> String {
    let api = api_base_from_health_url(health_url);
    format!(
        "==============================================\n\
         ai-corp deployed successfully\n\
         ==============================================\n\
         API:    {api}\n\
         Docs:   {api}/docs\n\
         Panel:  {panel_url}\n\
         Health: {health_url}\n"
    )
}

pub async fn run_deploy(
    cfg: &RuntimeConfig,
    wait_secs: Option<u64>,
    health_url: Option<String>,
) -> Result<()> {
    let path_env = std::env::var_os("PATH");
    check_prerequisites(&["docker".to_string()], path_env.as_deref())?;

    run_compose(cfg, &["build"]).await?;
    run_compose(cfg, &["up", "-d"]).await?;

    let wait = Duration::from_secs(wait_secs.unwrap_or(cfg.deploy_wait_secs));
    let health_url = health_url.unwrap_or_else(|| cfg.health_url.clone());
    println!("Waiting {}s for services to start...", wait.as_secs());
    tokio::time::sleep(wait).await;

    if !check_health(&health_url, HEALTH_TIMEOUT).await? {
        return Err(anyhow::anyhow!(
            "health check failed: '{}' did not return HTTP 200 after {}s",
            health_url,
            wait.as_secs()
        ));
    }
    print!("{}", render_deploy_banner(&health_url, &cfg.panel_url));
    Ok(())
}

pub async fn run_compose_command(cfg: &RuntimeConfig, command: ComposeCommands) -> Result<()> {
    match command {
        ComposeCommands::Up => run_compose(cfg, &["up", "-d", "--build"]).await,
        ComposeCommands::Down => run_compose(cfg, &["down"]).await,
        ComposeCommands::Logs { follow, service } => {
            let mut args = vec!["logs"];
            if follow {
                args.push("-f");
            }
            if let Some(service) = service.as_deref() {
                args.push(service);
            }
            run_compose(cfg, &args).await
        }
    }
}

pub async fn fetch_status(api_url: &str, timeout: Duration) -> Result<serde_json::Value> {
    let url = format!("{}/api/status", api_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client for status")?;
    client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("status request to '{url}' failed; is the API running?"))?
        .error_for_status()
        .with_context(|| format!("status endpoint '{url}' returned an error"))?
        .json::<serde_json::Value>()
        .await
        .with_context(|| format!("status endpoint '{url}' returned invalid JSON"))
}

pub async fn run_status(api_url: &str) -> Result<()> {
    let status = fetch_status(api_url, HEALTH_TIMEOUT).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Entries inside the output and logs directories; the directories stay.
pub fn clean_targets(cfg: &RuntimeConfig) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for dir in [&cfg.output_dir, &cfg.logs_dir] {
        let dir = Path::new(dir);
        if !dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list '{}'", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read entry in '{}'", dir.display()))?;
            targets.push(entry.path());
        }
    }
    targets.sort();
    Ok(targets)
}

pub fn run_clean(cfg: &RuntimeConfig, force: bool) -> Result<usize> {
    let targets = clean_targets(cfg)?;
    if targets.is_empty() {
        println!("Nothing to clean in '{}' or '{}'.", cfg.output_dir, cfg.logs_dir);
        return Ok(0);
    }
    if !force {
        println!("Would remove {} item(s):", targets.len());
        for target in &targets {
            println!("- {}", target.display());
        }
        println!("Re-run with --force to delete them.");
        return Ok(0);
    }
    for target in &targets {
        let removed = if target.is_dir() {
            std::fs::remove_dir_all(target)
        } else {
            std::fs::remove_file(target)
        };
        removed.with_context(|| format!("failed to remove '{}'", target.display()))?;
    }
    println!("Removed {} item(s).", targets.len());
    Ok(targets.len())
}
