use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{ModelSpec, ModelTier};
use crate::telemetry::unix_ms_now;

/// Fetches and removes model weights on the inference host.
#[async_trait]
pub trait ModelPuller: Send + Sync {
    async fn pull(&self, full_name: &str) -> Result<()>;
    async fn remove(&self, full_name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct OllamaCli;

async fn run_ollama(args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("ollama")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to launch 'ollama {}'", args.join(" ")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow::anyhow!(
        "'ollama {}' exited with {}: {}",
        args.join(" "),
        output.status,
        stderr.trim()
    ))
}

#[async_trait]
impl ModelPuller for OllamaCli {
    async fn pull(&self, full_name: &str) -> Result<()> {
        run_ollama(&["pull", full_name]).await
    }

    async fn remove(&self, full_name: &str) -> Result<()> {
        run_ollama(&["rm", full_name]).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedModel {
    pub tier: ModelTier,
    pub name: String,
    pub vram_gb: f64,
    pub priority: u32,
    pub loaded_at_unix_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VramStatus {
    pub total_vram_gb: f64,
    pub reserved_vram_gb: f64,
    pub used_vram_gb: f64,
    pub available_vram_gb: f64,
    pub max_models_loaded: usize,
    pub loaded_models: Vec<LoadedModel>,
}

/// Tracks usage from the models this process loaded; the GPU is never queried.
pub struct VramManager {
    total_vram_gb: f64,
    reserved_vram_gb: f64,
    max_models_loaded: usize,
    puller: Arc<dyn ModelPuller>,
    /// Held across the whole pull/remove so loads are serialized.
    load_lock: Mutex<()>,
    loaded: std::sync::RwLock<BTreeMap<ModelTier, LoadedModel>>,
}

impl VramManager {
    pub fn new(
        total_vram_gb: f64,
        reserved_vram_gb: f64,
        max_models_loaded: usize,
        puller: Arc<dyn ModelPuller>,
    ) -> Self {
        tracing::info!(
            total_vram_gb,
            available_vram_gb = (total_vram_gb - reserved_vram_gb).max(0.0),
            max_models_loaded,
            "vram manager initialized"
        );
        Self {
            total_vram_gb,
            reserved_vram_gb,
            max_models_loaded: max_models_loaded.max(1),
            puller,
            load_lock: Mutex::new(()),
            loaded: std::sync::RwLock::new(BTreeMap::new()),
        }
    }

    fn loaded_read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ModelTier, LoadedModel>> {
        self.loaded.read().unwrap_or_else(|e| e.into_inner())
    }

    fn loaded_write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ModelTier, LoadedModel>> {
        self.loaded.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn budget_gb(&self) -> f64 {
        (self.total_vram_gb - self.reserved_vram_gb).max(0.0)
    }

    pub fn used_vram(&self) -> f64 {
        self.loaded_read().values().map(|model| model.vram_gb).sum()
    }

    pub fn check_vram_availability(&self, required_gb: f64) -> bool {
        self.budget_gb() - self.used_vram() >= required_gb
    }

    pub fn is_loaded(&self, tier: ModelTier) -> bool {
        self.loaded_read().contains_key(&tier)
    }

    pub fn loaded_tiers(&self) -> Vec<ModelTier> {
        self.loaded_read().keys().copied().collect()
    }

    pub fn max_models_loaded(&self) -> usize {
        self.max_models_loaded
    }

    /// True when `tier` is loaded or a new model of `required_gb` would be
    /// accepted by both the VRAM budget and the model limit.
    pub fn can_serve(&self, tier: ModelTier, required_gb: f64) -> bool {
        let loaded = self.loaded_read();
        if loaded.contains_key(&tier) {
            return true;
        }
        let used = loaded.values().map(|model| model.vram_gb).sum::<f64>();
        loaded.len() < self.max_models_loaded && self.budget_gb() - used >= required_gb
    }

    /// Returns `Ok(false)` when the model cannot be loaded right now; errors
    /// are reserved for misuse such as loading a cloud tier.
    pub async fn load_model(&self, tier: ModelTier, spec: &ModelSpec, timeout: Duration) -> Result<bool> {
        if !tier.is_local() {
            return Err(anyhow::anyhow!(
                "model tier '{}' is not a local model and cannot be loaded",
                tier.label()
            ));
        }
        let _guard = self.load_lock.lock().await;

        if self.is_loaded(tier) {
            return Ok(true);
        }
        if self.loaded_read().len() >= self.max_models_loaded {
            tracing::warn!(
                tier = tier.label(),
                max_models_loaded = self.max_models_loaded,
                "model limit reached, not loading"
            );
            return Ok(false);
        }
        if !self.check_vram_availability(spec.vram_gb) {
            tracing::warn!(
                tier = tier.label(),
                required_gb = spec.vram_gb,
                used_gb = self.used_vram(),
                budget_gb = self.budget_gb(),
                "not enough VRAM to load model"
            );
            return Ok(false);
        }

        let full_name = spec.full_name();
        tracing::info!(tier = tier.label(), model = %full_name, "loading model");
        match tokio::time::timeout(timeout, self.puller.pull(&full_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(tier = tier.label(), model = %full_name, error = %err, "model pull failed");
                return Ok(false);
            }
            Err(_) => {
                tracing::error!(
                    tier = tier.label(),
                    model = %full_name,
                    timeout_secs = timeout.as_secs(),
                    "model pull timed out"
                );
                return Ok(false);
            }
        }

        self.loaded_write().insert(
            tier,
            LoadedModel {
                tier,
                name: full_name.clone(),
                vram_gb: spec.vram_gb,
                priority: spec.priority,
                loaded_at_unix_ms: unix_ms_now(),
            },
        );
        tracing::info!(tier = tier.label(), model = %full_name, "model loaded");
        Ok(true)
    }

    pub async fn unload_model(&self, tier: ModelTier) -> Result<bool> {
        let _guard = self.load_lock.lock().await;
        let Some(name) = self.loaded_read().get(&tier).map(|model| model.name.clone()) else {
            return Ok(false);
        };
        if let Err(err) = self.puller.remove(&name).await {
            tracing::error!(tier = tier.label(), model = %name, error = %err, "model unload failed");
            return Ok(false);
        }
        self.loaded_write().remove(&tier);
        tracing::info!(tier = tier.label(), model = %name, "model unloaded");
        Ok(true)
    }

    pub fn status(&self) -> VramStatus {
        let loaded_models = self.loaded_read().values().cloned().collect::<Vec<_>>();
        let used = loaded_models.iter().map(|model| model.vram_gb).sum::<f64>();
        VramStatus {
            total_vram_gb: self.total_vram_gb,
            reserved_vram_gb: self.reserved_vram_gb,
            used_vram_gb: used,
            available_vram_gb: self.budget_gb() - used,
            max_models_loaded: self.max_models_loaded,
            loaded_models,
        }
    }
}
