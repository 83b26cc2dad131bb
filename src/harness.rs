//! Wiring of the core services over the SQLite store.
//!
//! A [`Harness`] is what every command and the MCP server work through:
//! one store, the rule book and its embedding queue, the retrieval engine,
//! and (optionally) the configured embedding provider.

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use guidance_harness_core::embedding::EmbeddingProvider;
use guidance_harness_core::queue::EmbeddingQueue;
use guidance_harness_core::rules::RuleBook;
use guidance_harness_core::search::{RetrievalEngine, RetrievalOutcome, RetrievalQuery};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub struct Harness {
    config: Config,
    store: Arc<SqliteStore>,
    rules: RuleBook<SqliteStore>,
    engine: RetrievalEngine,
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl Harness {
    /// Connect to the configured database. No provider is attached.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        Self::from_store(config, Arc::new(SqliteStore::new(pool)))
    }

    pub fn from_store(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let queue = EmbeddingQueue::new(store.clone(), config.queue_config());
        Ok(Self {
            config: config.clone(),
            rules: RuleBook::new(store.clone(), queue),
            engine: RetrievalEngine::new(config.engine_config()?),
            store,
            provider: None,
        })
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.provider = provider;
        self
    }

    /// Attach the configured provider, requiring that it can be built.
    pub fn with_configured_provider(self) -> Result<Self> {
        let provider = embedding::create_provider(&self.config.embedding)?;
        Ok(self.with_provider(provider))
    }

    /// Attach the configured provider if it can be built. A provider that
    /// fails to initialise is logged and retrieval runs keyword-only.
    pub fn with_available_provider(self) -> Self {
        match embedding::create_provider(&self.config.embedding) {
            Ok(provider) => self.with_provider(provider),
            Err(e) => {
                warn!(error = %e, "embedding provider unavailable");
                self
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn rules(&self) -> &RuleBook<SqliteStore> {
        &self.rules
    }

    pub fn queue(&self) -> &EmbeddingQueue<SqliteStore> {
        self.rules.queue()
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    pub fn provider(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref()
    }

    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievalOutcome> {
        Ok(self
            .engine
            .retrieve(self.store.as_ref(), self.provider.as_deref(), query)
            .await?)
    }

    pub async fn close(self) {
        self.store.pool().close().await;
    }
}
