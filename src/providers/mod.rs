//! Provider adapters and their registry. Each upstream source implements
//! the uniform [`ProviderAdapter`] contract; the manager owns one
//! [`ResilientProvider`] envelope per source.

pub mod arxiv;
pub mod exa;
pub mod resilient;
pub mod semantic_scholar;
pub mod tavily;
pub mod traits;

pub use arxiv::ArxivAdapter;
pub use exa::ExaAdapter;
pub use resilient::ResilientProvider;
pub use semantic_scholar::SemanticScholarAdapter;
pub use tavily::TavilyAdapter;
pub use traits::{
    ProviderAdapter, ProviderCapabilities, ProviderQuery, ProviderSearchResult, SearchContext,
};

use crate::config::{Config, ProviderSettings};
use crate::models::{ProviderMetricsSnapshot, ProviderName, ProviderStatus};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Hosts the web-search providers are restricted to.
pub const SCHOLARLY_DOMAINS: &[&str] = &[
    "arxiv.org",
    "semanticscholar.org",
    "scholar.google.com",
    "pubmed.ncbi.nlm.nih.gov",
    "ncbi.nlm.nih.gov",
    "ieee.org",
    "dl.acm.org",
    "link.springer.com",
    "sciencedirect.com",
    "nature.com",
    "biorxiv.org",
    "openreview.net",
];

/// Stable source id for a web result: a short digest of its URL.
#[must_use]
pub fn url_source_id(url: &str) -> String {
    let digest = Sha256::digest(url.trim().as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Registry owning every provider and its resilience envelope.
pub struct ProviderManager {
    providers: HashMap<ProviderName, Arc<ResilientProvider>>,
}

impl ProviderManager {
    /// Build all four adapters from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers: HashMap<ProviderName, Arc<ResilientProvider>> = HashMap::new();

        let arxiv_settings = config.providers.arxiv.clone();
        providers.insert(
            ProviderName::Arxiv,
            Arc::new(ResilientProvider::new(
                Arc::new(ArxivAdapter::new(arxiv_settings.clone())?),
                arxiv_settings,
            )),
        );

        let s2_settings = config.providers.semantic_scholar.clone();
        providers.insert(
            ProviderName::SemanticScholar,
            Arc::new(ResilientProvider::new(
                Arc::new(SemanticScholarAdapter::new(s2_settings.clone())?),
                s2_settings,
            )),
        );

        let exa_settings = config.providers.exa.clone();
        providers.insert(
            ProviderName::Exa,
            Arc::new(ResilientProvider::new(
                Arc::new(ExaAdapter::new(exa_settings.clone())?),
                exa_settings,
            )),
        );

        let tavily_settings = config.providers.tavily.clone();
        providers.insert(
            ProviderName::Tavily,
            Arc::new(ResilientProvider::new(
                Arc::new(TavilyAdapter::new(tavily_settings.clone())?),
                tavily_settings,
            )),
        );

        info!(count = providers.len(), "provider registry initialized");
        Ok(Self { providers })
    }

    pub fn get(&self, name: ProviderName) -> Result<Arc<ResilientProvider>> {
        self.providers
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                resource: "provider".to_string(),
                id: name.to_string(),
            })
    }

    /// Enabled providers in stable declaration order.
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|name| {
                self.providers
                    .get(name)
                    .is_some_and(|p| p.is_enabled())
            })
            .collect()
    }

    pub async fn status_all(&self) -> HashMap<ProviderName, ProviderStatus> {
        let mut statuses = HashMap::new();
        for name in ProviderName::ALL {
            if let Some(provider) = self.providers.get(&name) {
                statuses.insert(name, provider.status().await);
            }
        }
        statuses
    }

    /// Metrics for one provider, or all of them.
    pub async fn metrics(&self, filter: Option<ProviderName>) -> Vec<ProviderMetricsSnapshot> {
        let mut snapshots = Vec::new();
        for name in ProviderName::ALL {
            if filter.is_some_and(|f| f != name) {
                continue;
            }
            if let Some(provider) = self.providers.get(&name) {
                snapshots.push(provider.metrics_snapshot().await);
            }
        }
        snapshots
    }

    /// Reconfigure one provider and return its fresh status.
    pub async fn configure(
        &self,
        name: ProviderName,
        settings: ProviderSettings,
    ) -> Result<ProviderStatus> {
        let provider = self.get(name)?;
        provider.configure(settings).await?;
        Ok(provider.status().await)
    }

    /// Probe every provider; returns per-provider health.
    pub async fn health_check_all(&self) -> HashMap<ProviderName, bool> {
        let mut results = HashMap::new();
        for name in ProviderName::ALL {
            if let Some(provider) = self.providers.get(&name) {
                results.insert(name, provider.health_check().await.is_ok());
            }
        }
        results
    }

    /// Capability declarations keyed by provider.
    #[must_use]
    pub fn capabilities(&self) -> HashMap<ProviderName, ProviderCapabilities> {
        self.providers
            .iter()
            .map(|(name, provider)| (*name, provider.adapter().capabilities()))
            .collect()
    }
}
