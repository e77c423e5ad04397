//! Liveness probing of the backing store.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

/// Outcome of a single liveness probe. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbeResult {
    pub reachable: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl HealthProbeResult {
    #[must_use]
    pub const fn healthy(latency: Duration) -> Self {
        Self {
            reachable: true,
            latency,
            error: None,
        }
    }

    #[must_use]
    pub fn unreachable(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Something that can tell whether a backing store endpoint is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, endpoint: &str) -> HealthProbeResult;
}

/// Probes `GET {endpoint}/readyz`.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    http: Client,
    api_key: Option<String>,
}

impl HttpHealthProbe {
    /// Create a probe whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(timeout: Duration, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;
        Ok(Self { http, api_key })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> HealthProbeResult {
        probe_readyz(&self.http, endpoint, self.api_key.as_deref()).await
    }
}

/// Shared readiness check used by the probe and the store client.
pub(crate) async fn probe_readyz(
    http: &Client,
    endpoint: &str,
    api_key: Option<&str>,
) -> HealthProbeResult {
    let started = Instant::now();
    let url = format!("{}/readyz", endpoint.trim_end_matches('/'));

    let mut request = http.get(&url);
    if let Some(key) = api_key {
        request = request.header("api-key", key);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            HealthProbeResult::healthy(started.elapsed())
        }
        Ok(response) => HealthProbeResult::unreachable(
            started.elapsed(),
            format!("{url} returned HTTP {}", response.status().as_u16()),
        ),
        Err(e) => HealthProbeResult::unreachable(started.elapsed(), e.to_string()),
    }
}
