use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agents::ceo::CeoAgent;
use crate::agents::content::ContentAgent;
use crate::agents::devops::DevOpsAgent;
use crate::agents::{AgentRegistry, GeneralAgent};
use crate::config::RuntimeConfig;
use crate::parser::{HttpFetcher, PageFetcher};
use crate::queue::{QueueSettings, TaskHandler, TaskQueue};
use crate::router::{ModelRouter, RouterClients};
use crate::telemetry::TelemetrySink;
use crate::vram::{ModelPuller, OllamaCli, VramManager};

/// Every long-lived component of the runtime, wired together.
pub struct Corporation {
    pub cfg: RuntimeConfig,
    pub router: Arc<ModelRouter>,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<AgentRegistry>,
    pub content: Arc<ContentAgent>,
    pub devops: Arc<DevOpsAgent>,
    pub ceo: CeoAgent,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Corporation {
    pub fn initialize(cfg: RuntimeConfig, telemetry: TelemetrySink) -> Result<Self> {
        let clients = RouterClients::from_config(&cfg).context("failed to build model provider clients")?;
        let fetcher = HttpFetcher::new(Duration::from_secs(cfg.request_timeout_secs))?;
        Ok(Self::with_components(
            cfg,
            telemetry,
            clients,
            Arc::new(OllamaCli),
            Arc::new(fetcher),
        ))
    }

    /// Same wiring as [`Corporation::initialize`] with caller-supplied backends.
    pub fn with_components(
        cfg: RuntimeConfig,
        telemetry: TelemetrySink,
        clients: RouterClients,
        puller: Arc<dyn ModelPuller>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let vram = Arc::new(VramManager::new(
            cfg.gpu_total_vram_gb,
            cfg.gpu_reserved_vram_gb,
            cfg.gpu_max_models_loaded,
            puller,
        ));
        let router = Arc::new(ModelRouter::new(&cfg, vram, clients));
        let queue = Arc::new(TaskQueue::new(
            QueueSettings::from_config(&cfg),
            telemetry.clone(),
        ));
        let content = Arc::new(ContentAgent::new(router.clone(), fetcher));
        let devops = Arc::new(DevOpsAgent::new(router.clone()));
        let registry = Arc::new(
            AgentRegistry::new(Arc::new(GeneralAgent::new(router.clone())))
                .register(content.clone())
                .register(devops.clone()),
        );
        let ceo = CeoAgent::new(
            router.clone(),
            queue.clone(),
            Duration::from_secs(cfg.mission_timeout_secs),
            telemetry,
        );
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            agents = ?registry.names(),
            max_concurrent_tasks = cfg.max_concurrent_tasks,
            "corporation initialized"
        );
        Self {
            cfg,
            router,
            queue,
            registry,
            content,
            devops,
            ceo,
            shutdown_tx,
            dispatcher: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawns the queue dispatcher. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return;
        }
        let handler: Arc<dyn TaskHandler> = self.registry.clone();
        let queue = self.queue.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *dispatcher = Some(tokio::spawn(queue.run(handler, shutdown_rx)));
        tracing::info!("corporation started");
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            handle.await.context("task queue dispatcher panicked")??;
        }
        tracing::info!("corporation stopped");
        Ok(())
    }
}
