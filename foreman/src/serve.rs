//! Service wiring for `foreman serve`.
//!
//! Builds the bus, repositories, orchestrator, composer and presence monitor
//! from a [`ForemanConfig`], and answers task requests on the bus.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::composer::{ComposeSettings, ComposeState, Composer, ComposerDeps};
use crate::core::approval::Evaluation;
use crate::core::providers::BuiltinProviders;
use crate::core::subjects;
use crate::core::types::{NewTask, Task};
use crate::io::bus::memory::MemoryBus;
use crate::io::bus::nats::NatsBus;
use crate::io::bus::{Bus, Message, Subscription, handler};
use crate::io::config::{BusBackend, BusConfig, ForemanConfig};
use crate::io::git::GitCli;
use crate::io::host::GitHubClient;
use crate::io::store::{RunRepository, TaskRepository};
use crate::orchestrator::Orchestrator;
use crate::presence::PresenceMonitor;

/// Everything a running foreman process owns.
pub struct Services {
    pub bus: Arc<dyn Bus>,
    pub orchestrator: Orchestrator,
    /// `None` when no compose remote is configured.
    pub composer: Option<Composer>,
    pub presence: PresenceMonitor,
    pub providers: BuiltinProviders,
    strict_approvals: bool,
}

pub async fn connect_bus(cfg: &BusConfig) -> Result<Arc<dyn Bus>> {
    match cfg.backend {
        BusBackend::Memory => Ok(Arc::new(MemoryBus::new())),
        BusBackend::Nats => {
            let bus = NatsBus::connect(&cfg.nats_url)
                .await
                .context("connect nats bus")?;
            Ok(Arc::new(bus))
        }
    }
}

impl Services {
    /// Wire services on the configured bus backend.
    pub async fn build(cfg: &ForemanConfig) -> Result<Self> {
        let bus = connect_bus(&cfg.bus).await?;
        Self::with_bus(cfg, bus).await
    }

    /// Wire services on an existing bus.
    pub async fn with_bus(cfg: &ForemanConfig, bus: Arc<dyn Bus>) -> Result<Self> {
        cfg.validate()?;
        let tasks = Arc::new(TaskRepository::new());
        let runs = Arc::new(RunRepository::new());
        let orchestrator = Orchestrator::new(
            bus.clone(),
            tasks,
            runs.clone(),
            cfg.compose.base_branch.clone(),
        );

        let composer = if cfg.compose.remote_url.trim().is_empty() {
            warn!("compose.remote_url is not set; composer disabled");
            None
        } else {
            let host = GitHubClient::from_env(&cfg.host.api_base, &cfg.host.token_env)?;
            let deps = ComposerDeps {
                bus: bus.clone(),
                runs,
                vcs: Arc::new(GitCli::default()),
                host: Arc::new(host),
                state: ComposeState::default(),
            };
            Some(Composer::new(
                deps,
                ComposeSettings::from_config(&cfg.compose, &cfg.host),
            )?)
        };

        let presence = PresenceMonitor::new();
        presence.start(bus.as_ref()).await?;

        Ok(Self {
            bus,
            orchestrator,
            composer,
            presence,
            providers: BuiltinProviders::new(),
            strict_approvals: cfg.approvals.strict,
        })
    }

    /// Create a task, start its run and attach the composer to it.
    ///
    /// The task watcher decides between `done` and `awaiting-approvals` from
    /// `run.pr` when the terminal status arrives. The composer records the PR
    /// only after it has pushed, so a composed task usually settles as `done`
    /// and its approval policy is not consulted.
    #[instrument(skip_all)]
    pub async fn submit_task(&self, new: NewTask) -> Result<Task> {
        let task = self.orchestrator.create_task(new)?;
        let run_id = self.orchestrator.start_task(&task.id).await?;
        if let Some(composer) = &self.composer {
            composer.attach(&run_id).await?;
        }
        self.orchestrator.tasks().require(&task.id)
    }

    /// Re-evaluate approvals for a task using the built-in providers.
    pub fn refresh_approvals(&self, task_id: &str) -> Result<Evaluation> {
        self.orchestrator.refresh_approvals(
            task_id,
            &self.providers.registry(),
            self.strict_approvals,
        )
    }

    /// Answer `tasks.create` and `tasks.get`. Dropping the returned
    /// subscriptions stops answering.
    pub async fn listen(self: &Arc<Self>) -> Result<Vec<Subscription>> {
        let create = {
            let this = self.clone();
            self.bus
                .subscribe(
                    subjects::TASKS_CREATE,
                    handler(move |message: Message| {
                        let this = this.clone();
                        async move {
                            let reply = this.handle_create(&message.payload).await;
                            this.reply(&message, reply).await
                        }
                    }),
                )
                .await
                .context("subscribe to tasks.create")?
        };
        let get = {
            let this = self.clone();
            self.bus
                .subscribe(
                    subjects::TASKS_GET,
                    handler(move |message: Message| {
                        let this = this.clone();
                        async move {
                            let reply = this.handle_get(&message.payload);
                            this.reply(&message, reply).await
                        }
                    }),
                )
                .await
                .context("subscribe to tasks.get")?
        };
        Ok(vec![create, get])
    }

    /// Stop listeners and release the bus.
    pub async fn shutdown(&self, listeners: Vec<Subscription>) -> Result<()> {
        drop(listeners);
        self.presence.stop();
        self.bus.close().await.context("close bus")?;
        Ok(())
    }

    async fn handle_create(&self, payload: &Value) -> Result<Value> {
        let new: NewTask =
            serde_json::from_value(payload.clone()).context("decode task request")?;
        let task = self.submit_task(new).await?;
        serde_json::to_value(&task).context("encode task")
    }

    fn handle_get(&self, payload: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct GetTask {
            id: String,
        }
        let GetTask { id } =
            serde_json::from_value(payload.clone()).context("decode task lookup")?;
        let task = self
            .orchestrator
            .tasks()
            .get(&id)
            .ok_or_else(|| anyhow!("task '{id}' not found"))?;
        serde_json::to_value(&task).context("encode task")
    }

    async fn reply(&self, message: &Message, reply: Result<Value>) -> Result<()> {
        let payload = match reply {
            Ok(value) => value,
            Err(err) => {
                debug!(subject = %message.subject, error = %format!("{err:#}"), "request failed");
                json!({"error": format!("{err:#}")})
            }
        };
        if message.reply.is_none() {
            return Ok(());
        }
        self.bus
            .respond(message, payload)
            .await
            .context("send reply")?;
        Ok(())
    }
}

/// Run the service until Ctrl-C.
pub async fn serve(cfg: ForemanConfig) -> Result<()> {
    let services = Arc::new(Services::build(&cfg).await?);
    let listeners = services.listen().await?;
    info!(
        backend = ?cfg.bus.backend,
        composer = services.composer.is_some(),
        "foreman serving"
    );
    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutting down");
    services.shutdown(listeners).await
}
