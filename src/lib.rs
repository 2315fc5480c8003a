//! Scholar Search - Federated Scholarly Literature Search
//!
//! This crate federates one logical query across multiple scholarly-metadata
//! sources (`arXiv`, `Semantic Scholar`, and the `Exa`/`Tavily` web search
//! APIs restricted to scholarly hosts), normalizes the responses into one
//! canonical paper model, merges and ranks them, and publishes lifecycle
//! events onto an embedded message bus.

pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod providers;
pub mod resilience;
pub mod search;
pub mod storage;
pub mod tools;

pub use broker::EmbeddedBroker;
pub use bus::{BusClient, EventPublisher, NoopPublisher};
pub use config::{Config, ConfigOverrides};
pub use error::{Error, ErrorClass, Result};
pub use models::{Paper, ProviderName, SearchRequest, SearchResponse};
pub use providers::ProviderManager;
pub use search::SearchOrchestrator;
pub use storage::Storage;
pub use tools::ToolFacade;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything a running service needs, wired from one [`Config`].
pub struct App {
    pub config: Config,
    pub broker: Option<Arc<EmbeddedBroker>>,
    pub bus: Option<BusClient>,
    pub orchestrator: Arc<SearchOrchestrator>,
    pub facade: Arc<ToolFacade>,
}

impl App {
    /// Build the provider registry, storage, broker (when enabled), bus
    /// client, orchestrator and tool facade.
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let providers = Arc::new(ProviderManager::from_config(&config)?);
        let storage = Storage::open(&config.storage, config.search.cache_ttl())?;
        storage.spawn_cleanup(Duration::from_secs(config.storage.cleanup_interval_secs));

        let (broker, bus): (Option<Arc<EmbeddedBroker>>, Option<BusClient>) =
            if config.broker.enabled {
                let broker = Arc::new(EmbeddedBroker::new(config.broker.clone()));
                broker.start().await?;
                let bus = broker
                    .client(Duration::from_secs(config.bus.request_timeout_secs))
                    .await?;
                (Some(broker), Some(bus))
            } else {
                (None, None)
            };

        // The orchestrator sees only the publish capability; with the
        // broker disabled it gets a no-op.
        let publisher: Arc<dyn EventPublisher> = match &bus {
            Some(bus) if config.bus.enabled => Arc::new(bus.clone()),
            _ => Arc::new(NoopPublisher),
        };

        let orchestrator = Arc::new(SearchOrchestrator::new(
            config.search.clone(),
            providers,
            storage.cache(),
            storage.history(),
            publisher,
        ));

        let facade = Arc::new(ToolFacade::new(orchestrator.clone()));
        if let Some(bus) = &bus {
            facade.clone().attach(bus).await?;
        }

        info!("application wired");
        Ok(Self {
            config,
            broker,
            bus,
            orchestrator,
            facade,
        })
    }

    /// Stop background components. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(broker) = &self.broker {
            broker.stop().await?;
        }
        Ok(())
    }
}
