//! Composition root: stores, ledger, job manager, executor, router, streamer.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulse_ai::{
    AnthropicClient, GoogleClient, OpenAiClient, Provider, ProviderKind, ProviderRouter,
    ProviderTimeouts, ScriptedProvider,
};
use pulse_infra::jobs::{InMemoryJobStore, JobKind, JobStore, PostgresJobStore};
use pulse_infra::ledger::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use pulse_infra::{
    AppConfig, ChatWorkHandler, JobExecutor, JobLifecycleManager, ProviderSettings,
    StatusStreamer, UsageLedger, db,
};

/// Shared, immutable service graph handed to every handler.
#[derive(Debug)]
pub struct AppServices {
    pub ledger: UsageLedger,
    pub jobs: Arc<JobLifecycleManager>,
    pub executor: Arc<JobExecutor>,
    pub router: Arc<ProviderRouter>,
    pub streamer: StatusStreamer,
    shutdown: CancellationToken,
}

impl AppServices {
    pub fn new(
        ledger_store: Arc<dyn LedgerStore>,
        job_store: Arc<dyn JobStore>,
        router: ProviderRouter,
        config: &AppConfig,
    ) -> Self {
        let ledger = UsageLedger::new(ledger_store);
        let jobs = Arc::new(JobLifecycleManager::new(job_store, ledger.clone()));
        let router = Arc::new(router);

        let mut executor = JobExecutor::new(jobs.clone(), config.executor.clone());
        executor.register_handler(JobKind::Chat, ChatWorkHandler::new(router.clone()));

        let shutdown = CancellationToken::new();
        let streamer = StatusStreamer::new(jobs.clone(), router.clone(), config.streamer)
            .with_shutdown(shutdown.clone());

        Self {
            ledger,
            jobs,
            executor: Arc::new(executor),
            router,
            streamer,
            shutdown,
        }
    }

    /// In-memory stores (dev/test).
    pub fn in_memory(router: ProviderRouter, config: &AppConfig) -> Self {
        Self::new(InMemoryLedgerStore::arc(), InMemoryJobStore::arc(), router, config)
    }

    /// End every open status stream.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let router = build_provider_router(&config.providers, config.timeouts)?;

    let Some(database_url) = &config.database_url else {
        info!("DATABASE_URL not set; using in-memory stores");
        return Ok(AppServices::in_memory(router, config));
    };

    let pool = db::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::ensure_schema(&pool)
        .await
        .context("failed to apply database schema")?;
    info!(max_connections = config.database_max_connections, "using Postgres stores");

    Ok(AppServices::new(
        Arc::new(PostgresLedgerStore::new(pool.clone())),
        Arc::new(PostgresJobStore::new(pool)),
        router,
        config,
    ))
}

/// Register one backend per provider that has a key; with `scripted` set, the
/// offline backend fills in for the rest.
pub fn build_provider_router(
    settings: &ProviderSettings,
    timeouts: ProviderTimeouts,
) -> anyhow::Result<ProviderRouter> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("pulse/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let mut builder = ProviderRouter::builder().with_timeouts(timeouts);
    for kind in ProviderKind::ALL {
        let provider = match settings.credentials(kind) {
            Some(creds) => {
                let base_url = creds.base_url.clone();
                match kind {
                    ProviderKind::OpenAi => {
                        let client = OpenAiClient::new(http.clone(), creds.api_key.clone());
                        Provider::OpenAi(match base_url {
                            Some(url) => client.with_base_url(url),
                            None => client,
                        })
                    }
                    ProviderKind::Anthropic => {
                        let client = AnthropicClient::new(http.clone(), creds.api_key.clone());
                        Provider::Anthropic(match base_url {
                            Some(url) => client.with_base_url(url),
                            None => client,
                        })
                    }
                    ProviderKind::Google => {
                        let client = GoogleClient::new(http.clone(), creds.api_key.clone());
                        Provider::Google(match base_url {
                            Some(url) => client.with_base_url(url),
                            None => client,
                        })
                    }
                }
            }
            None if settings.scripted => {
                warn!(provider = kind.as_str(), "no API key; registering the scripted backend");
                Provider::Scripted(ScriptedProvider::echo())
            }
            None => continue,
        };
        builder = builder.with_provider(kind, provider);
    }

    Ok(builder.build())
}
