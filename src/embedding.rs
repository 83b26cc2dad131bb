//! Concrete embedding providers.
//!
//! Implements the core [`EmbeddingProvider`] trait for:
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` on the OpenAI API.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//! - **`LocalProvider`**: in-process inference via fastembed (cargo feature
//!   `local-embeddings`).
//!
//! Providers make exactly one request per call and never retry on their
//! own: the job queue owns retry and backoff. Each failure is classified
//! for the queue:
//!
//! | Failure | Class |
//! |---------|-------|
//! | HTTP 429, HTTP 5xx, network error, timeout | [`ProviderError::Transient`] |
//! | Any other HTTP 4xx, malformed response body | [`ProviderError::Permanent`] |
//!
//! Use [`create_provider`] to build the provider named in `[embedding]`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use guidance_harness_core::embedding::EmbeddingProvider;
use guidance_harness_core::ProviderError;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Map a non-success HTTP status to a provider error.
fn classify_status(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} API error {}: {}", provider, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// Send `body` as JSON and return the parsed response body.
async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value, ProviderError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::Transient(format!("{} request failed: {}", provider, e)))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, status, &text));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::Permanent(format!("{} response is not JSON: {}", provider, e)))
}

fn parse_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| ProviderError::Permanent(format!("Invalid {}: embedding is not an array", what)))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::Permanent(format!("Invalid {}: non-numeric value", what)))
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client(config)?,
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        // Only the v3 models accept a reduced output dimension.
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::json!(self.dims);
        }

        let request = self.client.post(OPENAI_URL).bearer_auth(&self.api_key);
        let json = post_json("OpenAI", request, &body).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[0].embedding` from an OpenAI response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing data[0].embedding".into())
        })?;
    parse_vector(embedding, "OpenAI response")
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with the model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        let request = self.client.post(format!("{}/api/embed", self.url));
        let json = post_json("Ollama", request, &body).await?;
        parse_ollama_response(&json)
    }
}

/// Extract `embeddings[0]` from an Ollama response.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid Ollama response: missing embeddings array".into())
        })?;
    parse_vector(embedding, "Ollama response")
}

// ============ Local Provider (fastembed) ============

/// Model name and dimension for the `local` provider, defaulting to
/// `all-minilm-l6-v2` and the model's native dimension.
pub fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

/// In-process embedding via fastembed. The model is downloaded on first
/// use and kept loaded for the life of the provider.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!("Unknown local embedding model: '{}'", other),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let slot = self.model.clone();
        let model_name = self.model_name.clone();
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| ProviderError::Permanent("local model lock poisoned".into()))?;
            if guard.is_none() {
                let which = config_to_fastembed_model(&model_name)
                    .map_err(|e| ProviderError::Permanent(e.to_string()))?;
                let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(which))
                    .map_err(|e| {
                        ProviderError::Transient(format!(
                            "Failed to initialize local embedding model: {}",
                            e
                        ))
                    })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| ProviderError::Permanent("local model not loaded".into()))?;
            let mut vectors = model
                .embed(vec![text], None)
                .map_err(|e| ProviderError::Permanent(format!("Local embedding failed: {}", e)))?;
            vectors
                .pop()
                .ok_or_else(|| ProviderError::Permanent("Local embedding returned nothing".into()))
        })
        .await
        .map_err(|e| ProviderError::Transient(format!("local embedding task failed: {}", e)))?
    }
}

/// Create the provider named in `[embedding].provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | `None` |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires the `local-embeddings` feature) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Arc::new(OpenAIProvider::new(config)?),
        "ollama" => Arc::new(OllamaProvider::new(config)?),
        #[cfg(feature = "local-embeddings")]
        "local" => Arc::new(LocalProvider::new(config)?),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!(
            "embedding provider 'local' requires building with --features local-embeddings"
        ),
        other => bail!("Unknown embedding provider: '{}'", other),
    };
    Ok(Some(provider))
}
