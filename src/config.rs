//! Configuration parsing and validation.
//!
//! Guidance Harness is configured via a TOML file (default: `config/guide.toml`).
//! Every section except `[db]` may be omitted; fields fall back to the
//! defaults below.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/guide.sqlite"
//!
//! [embedding]
//! provider = "openai"           # "disabled" | "openai" | "ollama" | "local"
//! model = "text-embedding-3-small"
//! dims = 1536
//! timeout_secs = 30
//!
//! [retrieval]
//! mode = "auto"                 # "auto" | "keyword" | "vector"
//! max_results = 10
//! vector_threshold = 0.7
//! fallback_threshold = 0.5
//!
//! [worker]
//! poll_interval_secs = 5
//! sweep_interval_secs = 60
//! stuck_timeout_secs = 600
//! max_attempts = 3
//! concurrency = 1
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```
//!
//! [`load_config`] rejects out-of-range values up front so that the core
//! services never see an inconsistent configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use guidance_harness_core::jobs::{QueueConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
use guidance_harness_core::search::{
    EngineMode, RetrievalConfig as EngineConfig, DEFAULT_FALLBACK_THRESHOLD,
    DEFAULT_MAX_RESULTS, DEFAULT_VECTOR_THRESHOLD,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP request timeout for a single embedding call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name and dimension the queue records jobs under.
    ///
    /// For the `local` provider both fall back to the bundled default model.
    pub fn model_and_dims(&self) -> Option<(String, usize)> {
        if !self.is_enabled() {
            return None;
        }
        if self.provider == "local" {
            return Some(crate::embedding::resolve_local_model(self));
        }
        Some((self.model.clone()?, self.dims?))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f32,
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_results: default_max_results(),
            vector_threshold: default_vector_threshold(),
            fallback_threshold: default_fallback_threshold(),
        }
    }
}

fn default_mode() -> String {
    "auto".to_string()
}
fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}
fn default_vector_threshold() -> f32 {
    DEFAULT_VECTOR_THRESHOLD
}
fn default_fallback_threshold() -> f32 {
    DEFAULT_FALLBACK_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on one provider call made by a worker. Defaults to
    /// `embedding.timeout_secs` plus a small margin.
    #[serde(default)]
    pub provider_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stuck_timeout_secs: default_stuck_timeout_secs(),
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            provider_timeout_secs: None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_stuck_timeout_secs() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Defaults for every section, pointed at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            worker: WorkerConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Queue policy derived from `[embedding]` and `[worker]`.
    pub fn queue_config(&self) -> QueueConfig {
        match self.embedding.model_and_dims() {
            Some((model, dims)) => QueueConfig {
                enabled: true,
                embedding_model: model,
                dims,
                max_attempts: self.worker.max_attempts,
                backoff_base: DEFAULT_BACKOFF_BASE,
                backoff_cap: DEFAULT_BACKOFF_CAP,
                stuck_timeout: Duration::from_secs(self.worker.stuck_timeout_secs),
            },
            None => QueueConfig {
                max_attempts: self.worker.max_attempts,
                stuck_timeout: Duration::from_secs(self.worker.stuck_timeout_secs),
                ..QueueConfig::disabled()
            },
        }
    }

    /// Retrieval policy derived from `[retrieval]`.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            mode: self.retrieval.mode.parse::<EngineMode>()?,
            max_results: self.retrieval.max_results,
            vector_threshold: self.retrieval.vector_threshold,
            fallback_threshold: self.retrieval.fallback_threshold,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.worker.sweep_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(
            self.worker
                .provider_timeout_secs
                .unwrap_or(self.embedding.timeout_secs + 5),
        )
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.max_results < 1 {
        bail!("retrieval.max_results must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.vector_threshold) {
        bail!("retrieval.vector_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.fallback_threshold) {
        bail!("retrieval.fallback_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.fallback_threshold > config.retrieval.vector_threshold {
        bail!("retrieval.fallback_threshold must not exceed retrieval.vector_threshold");
    }
    config.retrieval.mode.parse::<EngineMode>()?;

    // Worker
    if config.worker.max_attempts < 1 {
        bail!("worker.max_attempts must be >= 1");
    }
    if config.worker.poll_interval_secs == 0 {
        bail!("worker.poll_interval_secs must be > 0");
    }
    if config.worker.sweep_interval_secs == 0 {
        bail!("worker.sweep_interval_secs must be > 0");
    }
    if config.worker.concurrency == 0 {
        bail!("worker.concurrency must be >= 1");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    Ok(())
}
