//! The embedding capability.
//!
//! Embedding is opaque to the consistency layer: a provider turns text into
//! a vector for one model, and the validator checks the result. Providers
//! are created lazily, once per model, and shared afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use anchorage_core::{ModelDescriptor, Provider};
use anchorage_store::Config;

use crate::error::EmbedError;

const OPENAI_API_BASE: &str = "https://api.openai.com";

/// Computes embeddings for a single model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + fmt::Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Builds a provider for a registry model.
pub trait ProviderFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        model: &'static ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingProvider>, EmbedError>;
}

/// One provider per model, created on first use.
#[derive(Debug)]
pub struct ProviderCache {
    factory: Arc<dyn ProviderFactory>,
    providers: RwLock<HashMap<&'static str, Arc<dyn EmbeddingProvider>>>,
}

impl ProviderCache {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// The provider for `model`, creating it if this is the first request.
    pub fn get(
        &self,
        model: &'static ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        if let Some(provider) = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model.name)
        {
            return Ok(Arc::clone(provider));
        }

        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = providers.get(model.name) {
            return Ok(Arc::clone(provider));
        }
        log::debug!("Initialising embedding provider for {}", model);
        let provider = self.factory.create(model)?;
        providers.insert(model.name, Arc::clone(&provider));
        Ok(provider)
    }

    /// Number of initialised providers.
    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Calls `POST {base}/v1/embeddings`.
///
/// Works with OpenAI itself and with local servers that expose the same
/// API, such as LM Studio, Ollama and text-embeddings-inference.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    http: Client,
    url: String,
    api_key: Option<String>,
    model: &'static ModelDescriptor,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &'static ModelDescriptor,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(anchorage_store::USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            url: embeddings_url(base_url),
            api_key,
            model,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Accept a server root, a `/v1` base or the full endpoint.
fn embeddings_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/embeddings") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = EmbeddingRequest {
            model: self.model.name,
            input: [text],
        };
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EmbedError::Http {
                model: self.model.name.to_string(),
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| EmbedError::Parse {
            model: self.model.name.to_string(),
            message: e.to_string(),
        })?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Parse {
                model: self.model.name.to_string(),
                message: "response contained no embeddings".to_string(),
            })
    }
}

/// Creates [`OpenAiCompatibleProvider`]s from the configuration.
///
/// OpenAI models fall back to the public OpenAI endpoint when no
/// `embedding_url` is set; other models need one.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpProviderFactory {
    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url,
            api_key,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.embedding_url.clone(),
            config.embedding_api_key.clone(),
            config.request_timeout(),
        )
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(
        &self,
        model: &'static ModelDescriptor,
    ) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
        let base = match (&self.base_url, model.provider) {
            (Some(url), _) => url.as_str(),
            (None, Provider::OpenAi) => OPENAI_API_BASE,
            (None, Provider::FastEmbed) => {
                return Err(EmbedError::NotConfigured {
                    model: model.name.to_string(),
                    reason: "set embedding_url to an OpenAI-compatible server".to_string(),
                })
            }
        };
        let provider =
            OpenAiCompatibleProvider::new(base, self.api_key.clone(), model, self.timeout)?;
        Ok(Arc::new(provider))
    }
}
