use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{ModelTier, RuntimeConfig};
use crate::vram::{ModelPuller, OllamaCli};

pub const WORKSPACE_DIRS: &[&str] = &["core", "configs", "output", "logs", "tests"];

const ENV_TEMPLATE: &str = "\
# ai-corp environment. Values here are loaded before command-line parsing.
OPENAI_API_KEY=
ANTHROPIC_API_KEY=
DATABASE_URL=sqlite:///./data/ai_corp.db
OLLAMA_HOST=http://localhost:11434
# When set, POST routes require `Authorization: Bearer <token>`.
AI_CORP_API_TOKEN=
";

const CONFIG_TEMPLATE: &str = r#"# ai-corp configuration. CLI flags and AI_CORP_* variables take precedence.

[gpu]
total_vram_gb = 24.0
reserved_vram_gb = 2.0
max_models_loaded = 2
load_timeout_secs = 600

[queue]
max_concurrent_tasks = 3
task_timeout_secs = 600
max_retries = 3
retry_base_delay_ms = 1000
mission_timeout_secs = 7200

[router]
ollama_base_url = "http://localhost:11434"
cloud_threshold = 0.8
request_timeout_secs = 120

[server]
host = "0.0.0.0"
port = 8000

[deploy]
compose_command = "docker compose"
health_url = "http://localhost:8000/health"
wait_secs = 30
panel_url = "http://localhost:8080"

[paths]
output_dir = "output"
logs_dir = "logs"

[telemetry]
enabled = true

[models.local_small]
name = "qwen2.5"
quantization = "7b"
vram_gb = 5.0
priority = 3

[models.local_medium]
name = "qwen2.5"
quantization = "14b"
vram_gb = 10.0
priority = 2

[models.local_large]
name = "qwen2.5"
quantization = "32b"
vram_gb = 20.0
priority = 1
"#;

const SMOKE_TEST_TEMPLATE: &str = r#""""Smoke test for a running ai-corp API. Standard library only."""
import json
import os
import unittest
import urllib.request

API_URL = os.environ.get("AI_CORP_API_URL", "http://localhost:8000")


class HealthTest(unittest.TestCase):
    def test_health_endpoint(self):
        with urllib.request.urlopen(f"{API_URL}/health", timeout=10) as response:
            self.assertEqual(response.status, 200)
            body = json.loads(response.read().decode("utf-8"))
            self.assertEqual(body.get("status"), "healthy")


if __name__ == "__main__":
    unittest.main()
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

pub fn find_executable(tool: &str, path_env: Option<&OsStr>) -> Option<PathBuf> {
    let path_env = path_env?;
    std::env::split_paths(path_env)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Fails naming every tool that is not an executable on `path_env`.
pub fn check_prerequisites(tools: &[String], path_env: Option<&OsStr>) -> Result<()> {
    let missing = tools
        .iter()
        .filter(|tool| find_executable(tool, path_env).is_none())
        .map(String::as_str)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "missing prerequisite tool(s): {}. Install them and re-run.",
        missing.join(", ")
    ))
}

fn write_if_absent(root: &Path, relative: &str, content: &str, report: &mut SetupReport) -> Result<()> {
    let path = root.join(relative);
    if path.exists() {
        report.skipped.push(relative.to_string());
        return Ok(());
    }
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    report.created.push(relative.to_string());
    Ok(())
}

/// Creates the workspace layout under `root`. Existing files are never
/// overwritten, so running it twice is safe.
pub fn scaffold_workspace(root: &Path) -> Result<SetupReport> {
    let mut report = SetupReport::default();
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create workspace root '{}'", root.display()))?;

    for dir in WORKSPACE_DIRS {
        let path = root.join(dir);
        if path.is_dir() {
            report.skipped.push(format!("{dir}/"));
            continue;
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create directory '{}'", path.display()))?;
        report.created.push(format!("{dir}/"));
    }

    write_if_absent(root, ".env", ENV_TEMPLATE, &mut report)?;
    write_if_absent(root, "configs/ai-corp.toml", CONFIG_TEMPLATE, &mut report)?;
    write_if_absent(root, "tests/test_basic.py", SMOKE_TEST_TEMPLATE, &mut report)?;
    Ok(report)
}

pub async fn pull_configured_models(cfg: &RuntimeConfig, puller: &dyn ModelPuller) -> Result<usize> {
    let timeout = Duration::from_secs(cfg.model_load_timeout_secs);
    let mut pulled = 0usize;
    for tier in ModelTier::LOCAL {
        let Some(spec) = cfg.models.get(&tier) else {
            continue;
        };
        let full_name = spec.full_name();
        println!("Pulling {} ({})...", full_name, tier.label());
        tokio::time::timeout(timeout, puller.pull(&full_name))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "model pull for '{}' timed out after {}s",
                    full_name,
                    timeout.as_secs()
                )
            })?
            .with_context(|| format!("failed to pull model '{full_name}'"))?;
        pulled += 1;
    }
    Ok(pulled)
}

pub async fn run_pull_models(cfg: &RuntimeConfig) -> Result<()> {
    let path_env: Option<OsString> = std::env::var_os("PATH");
    check_prerequisites(&["ollama".to_string()], path_env.as_deref())?;
    let puller: Arc<dyn ModelPuller> = Arc::new(OllamaCli);
    let pulled = pull_configured_models(cfg, puller.as_ref()).await?;
    println!("Pulled {pulled} model(s).");
    Ok(())
}

pub async fn run_setup(cfg: &RuntimeConfig, dir: &str, pull_models: bool) -> Result<SetupReport> {
    let path_env = std::env::var_os("PATH");
    check_prerequisites(&cfg.required_tools, path_env.as_deref())?;
    println!("Prerequisites found: {}", cfg.required_tools.join(", "));

    let root = PathBuf::from(dir);
    let report = scaffold_workspace(&root)?;
    for item in &report.created {
        println!("created  {}", root.join(item).display());
    }
    for item in &report.skipped {
        println!("exists   {}", root.join(item).display());
    }
    tracing::info!(
        root = %root.display(),
        created = report.created.len(),
        skipped = report.skipped.len(),
        "workspace scaffolded"
    );

    if pull_models {
        run_pull_models(cfg).await?;
    } else {
        println!("Skipping model download (pass --pull-models or run 'ai-corp pull-models').");
    }
    println!("Setup complete. Edit .env with your API keys, then run 'ai-corp deploy'.");
    Ok(report)
}
