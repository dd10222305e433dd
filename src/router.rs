use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{ModelSpec, ModelTier, RuntimeConfig, anthropic_api_key, openai_api_key};
use crate::provider::{
    AnthropicClient, Completion, CompletionRequest, LlmClient, OllamaClient,
    OpenAiClient,
};
use crate::vram::VramManager;

const SMALL_COMPLEXITY_CEILING: f64 = 0.35;
const MEDIUM_COMPLEXITY_CEILING: f64 = 0.65;

/// Backends available to the router. Any of them may be absent.
#[derive(Clone, Default)]
pub struct RouterClients {
    pub local: Option<Arc<dyn LlmClient>>,
    pub claude: Option<Arc<dyn LlmClient>>,
    pub openai: Option<Arc<dyn LlmClient>>,
}

impl RouterClients {
    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.request_timeout_secs);
        let local: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(&cfg.ollama_base_url, timeout)?);
        let claude = match anthropic_api_key() {
            Some(key) => Some(Arc::new(AnthropicClient::new(key, timeout)?) as Arc<dyn LlmClient>),
            None => None,
        };
        let openai = match openai_api_key() {
            Some(key) => Some(Arc::new(OpenAiClient::new(key, timeout)?) as Arc<dyn LlmClient>),
            None => None,
        };
        Ok(Self {
            local: Some(local),
            claude,
            openai,
        })
    }

    pub fn has_cloud(&self) -> bool {
        self.claude.is_some() || self.openai.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelChoice {
    pub tier: ModelTier,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub task_type: String,
    pub complexity: f64,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, task_type: impl Into<String>, complexity: f64) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            task_type: task_type.into(),
            complexity,
            max_tokens: 2048,
            temperature: 0.7,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelResponse {
    pub text: String,
    pub model_used: String,
    pub tier: ModelTier,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

impl ModelResponse {
    pub fn tokens_used(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterUsage {
    pub requests: u64,
    pub cloud_fallbacks: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableModels {
    pub loaded: Vec<String>,
    pub available: Vec<String>,
    pub cloud: Vec<String>,
}

pub struct ModelRouter {
    models: BTreeMap<ModelTier, ModelSpec>,
    cloud_threshold: f64,
    load_timeout: Duration,
    vram: Arc<VramManager>,
    clients: RouterClients,
    usage: Mutex<RouterUsage>,
}

impl ModelRouter {
    pub fn new(cfg: &RuntimeConfig, vram: Arc<VramManager>, clients: RouterClients) -> Self {
        Self {
            models: cfg.models.clone(),
            cloud_threshold: cfg.cloud_threshold,
            load_timeout: Duration::from_secs(cfg.model_load_timeout_secs),
            vram,
            clients,
            usage: Mutex::new(RouterUsage::default()),
        }
    }

    pub fn vram(&self) -> &Arc<VramManager> {
        &self.vram
    }

    pub fn models(&self) -> &BTreeMap<ModelTier, ModelSpec> {
        &self.models
    }

    pub fn usage(&self) -> RouterUsage {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn choice(&self, tier: ModelTier) -> Option<ModelChoice> {
        let spec = self.models.get(&tier)?;
        let model = if tier.is_local() {
            spec.full_name()
        } else {
            spec.name.clone()
        };
        Some(ModelChoice { tier, model })
    }

    fn cloud_choice(&self) -> Option<ModelChoice> {
        if self.clients.claude.is_some() {
            if let Some(choice) = self.choice(ModelTier::CloudClaude) {
                return Some(choice);
            }
        }
        if self.clients.openai.is_some() {
            return self.choice(ModelTier::CloudOpenai);
        }
        None
    }

    fn fits_locally(&self, tier: ModelTier) -> bool {
        match self.models.get(&tier) {
            Some(spec) => self.vram.can_serve(tier, spec.vram_gb),
            None => false,
        }
    }

    pub fn tier_for_complexity(task_type: &str, complexity: f64) -> ModelTier {
        let tier = if complexity < SMALL_COMPLEXITY_CEILING {
            ModelTier::LocalSmall
        } else if complexity < MEDIUM_COMPLEXITY_CEILING {
            ModelTier::LocalMedium
        } else {
            ModelTier::LocalLarge
        };
        if task_type.eq_ignore_ascii_case("code") && tier == ModelTier::LocalSmall {
            ModelTier::LocalMedium
        } else {
            tier
        }
    }

    pub fn select_model(&self, task_type: &str, complexity: f64) -> ModelChoice {
        let complexity = if complexity.is_nan() {
            0.5
        } else {
            complexity.clamp(0.0, 1.0)
        };

        if complexity >= self.cloud_threshold || self.clients.local.is_none() {
            if let Some(choice) = self.cloud_choice() {
                return choice;
            }
        }

        let preferred = Self::tier_for_complexity(task_type, complexity);
        let fitting_local = ModelTier::LOCAL
            .iter()
            .rev()
            .copied()
            .filter(|tier| *tier <= preferred)
            .find(|tier| self.fits_locally(*tier));
        // A larger model that is already resident beats one that can never load.
        let resident_larger = || {
            self.vram
                .loaded_tiers()
                .into_iter()
                .filter(|tier| tier.is_local() && *tier > preferred)
                .min()
        };
        if self.clients.local.is_some() {
            if let Some(choice) = fitting_local
                .or_else(resident_larger)
                .and_then(|tier| self.choice(tier))
            {
                if choice.tier != preferred {
                    tracing::info!(
                        preferred = preferred.label(),
                        selected = choice.tier.label(),
                        "preferred tier does not fit VRAM budget, using another local model"
                    );
                }
                return choice;
            }
        }
        if let Some(choice) = self.cloud_choice() {
            return choice;
        }

        self.choice(ModelTier::LocalSmall).unwrap_or(ModelChoice {
            tier: ModelTier::LocalSmall,
            model: ModelTier::LocalSmall.label().to_string(),
        })
    }

    fn client_for(&self, tier: ModelTier) -> Option<&Arc<dyn LlmClient>> {
        match tier {
            ModelTier::LocalSmall | ModelTier::LocalMedium | ModelTier::LocalLarge => {
                self.clients.local.as_ref()
            }
            ModelTier::CloudClaude => self.clients.claude.as_ref(),
            ModelTier::CloudOpenai => self.clients.openai.as_ref(),
        }
    }

    async fn call(&self, choice: &ModelChoice, request: &GenerateRequest) -> Result<Completion> {
        let client = self.client_for(choice.tier).ok_or_else(|| {
            anyhow::anyhow!(
                "no provider client configured for model tier '{}'",
                choice.tier.label()
            )
        })?;

        if choice.tier.is_local() {
            let spec = self.models.get(&choice.tier).ok_or_else(|| {
                anyhow::anyhow!("model tier '{}' missing from catalog", choice.tier.label())
            })?;
            let loaded = self
                .vram
                .load_model(choice.tier, spec, self.load_timeout)
                .await?;
            if !loaded {
                return Err(anyhow::anyhow!(
                    "model '{}' could not be loaded (insufficient VRAM, model limit, or pull failure)",
                    choice.model
                ));
            }
        }

        let completion_request = CompletionRequest {
            model: choice.model.clone(),
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        client.complete(&completion_request).await.with_context(|| {
            format!(
                "{} model '{}' request failed",
                client.backend().label(),
                choice.model
            )
        })
    }

    fn finish(&self, choice: ModelChoice, completion: Completion, started: Instant) -> ModelResponse {
        let tokens = completion.tokens_in + completion.tokens_out;
        let cost_usd = match self.models.get(&choice.tier) {
            Some(spec) if !choice.tier.is_local() => tokens as f64 / 1000.0 * spec.cost_per_1k_tokens,
            _ => 0.0,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        {
            let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
            usage.requests += 1;
            usage.tokens += tokens;
            usage.cost_usd += cost_usd;
        }
        tracing::debug!(
            tier = choice.tier.label(),
            model = %choice.model,
            tokens,
            cost_usd,
            latency_ms,
            "model generation completed"
        );

        ModelResponse {
            text: completion.text,
            model_used: choice.model,
            tier: choice.tier,
            tokens_in: completion.tokens_in,
            tokens_out: completion.tokens_out,
            cost_usd,
            latency_ms,
        }
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<ModelResponse> {
        let choice = self.select_model(&request.task_type, request.complexity);
        let started = Instant::now();
        match self.call(&choice, &request).await {
            Ok(completion) => Ok(self.finish(choice, completion, started)),
            Err(err) if choice.tier.is_local() => {
                let Some(cloud) = self.cloud_choice() else {
                    return Err(err);
                };
                tracing::warn!(
                    from = choice.tier.label(),
                    to = cloud.tier.label(),
                    error = %err,
                    "local model failed, falling back to cloud"
                );
                {
                    let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
                    usage.cloud_fallbacks += 1;
                }
                let started = Instant::now();
                let completion = self
                    .call(&cloud, &request)
                    .await
                    .with_context(|| format!("cloud fallback after local failure: {err:#}"))?;
                Ok(self.finish(cloud, completion, started))
            }
            Err(err) => Err(err),
        }
    }

    pub fn available_models(&self) -> AvailableModels {
        let loaded = self
            .vram
            .loaded_tiers()
            .into_iter()
            .map(|tier| tier.label().to_string())
            .collect();
        let available = if self.clients.local.is_some() {
            ModelTier::LOCAL
                .iter()
                .filter(|tier| self.models.contains_key(tier))
                .map(|tier| tier.label().to_string())
                .collect()
        } else {
            Vec::new()
        };
        let mut cloud = Vec::new();
        if self.clients.claude.is_some() {
            cloud.push(ModelTier::CloudClaude.label().to_string());
        }
        if self.clients.openai.is_some() {
            cloud.push(ModelTier::CloudOpenai.label().to_string());
        }
        AvailableModels {
            loaded,
            available,
            cloud,
        }
    }
}
