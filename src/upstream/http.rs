//! JSON-over-HTTP upstream client with last-known-good fallback.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::config::UpstreamConfig;
use crate::connection::state::unix_millis;
use crate::error::LinkError;
use crate::resilience::{CircuitBreaker, CircuitError, TripsBreaker};

/// A body from the upstream, possibly served from cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamResponse {
    pub body: Value,
    /// Served from the last-known-good cache because the live call did not succeed.
    pub stale: bool,
    /// Unix timestamp (ms) when the body was fetched.
    pub fetched_at: u64,
}

#[derive(Debug, Clone)]
struct CachedBody {
    body: Value,
    fetched_at: u64,
}

#[derive(Debug)]
pub struct HttpUpstream {
    name: String,
    base_url: Url,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    last_good: DashMap<String, CachedBody>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, LinkError> {
        let error = |message: String| LinkError::Upstream {
            name: config.name.clone(),
            status: None,
            message,
        };

        let base_url = Url::parse(&config.base_url).map_err(|e| error(format!("invalid base_url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("device-link/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| error(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: config.name.clone(),
            base_url,
            client,
            breaker,
            last_good: DashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn error(&self, status: Option<u16>, message: impl Into<String>) -> LinkError {
        LinkError::Upstream {
            name: self.name.clone(),
            status,
            message: message.into(),
        }
    }

    async fn fetch(&self, url: Url) -> Result<Value, LinkError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.error(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.error(Some(status.as_u16()), format!("HTTP {}", status)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| self.error(None, format!("invalid JSON body: {}", e)))
    }

    /// GET `path` (relative to `base_url`) as JSON.
    ///
    /// When the breaker rejects the call, or the call fails in a way that trips the
    /// breaker, the last successful body for `path` is returned with `stale: true`.
    pub async fn get_json(&self, path: &str) -> Result<UpstreamResponse, LinkError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| self.error(None, format!("invalid path {}: {}", path, e)))?;

        let result = self
            .breaker
            .fire_with_fallback(
                || async {
                    let body = self.fetch(url).await?;
                    Ok::<_, LinkError>(UpstreamResponse {
                        body,
                        stale: false,
                        fetched_at: unix_millis(),
                    })
                },
                |err| {
                    if let CircuitError::Inner(inner) = &err {
                        if !inner.trips_breaker() {
                            return Err(err);
                        }
                    }
                    match self.last_good.get(path) {
                        Some(cached) => {
                            tracing::warn!(
                                upstream = %self.name,
                                path = %path,
                                error = %err,
                                "Serving last known good response"
                            );
                            Ok(UpstreamResponse {
                                body: cached.body.clone(),
                                stale: true,
                                fetched_at: cached.fetched_at,
                            })
                        }
                        None => Err(err),
                    }
                },
            )
            .await;

        let response = result.map_err(LinkError::from)?;
        if !response.stale {
            self.last_good.insert(
                path.to_string(),
                CachedBody {
                    body: response.body.clone(),
                    fetched_at: response.fetched_at,
                },
            );
        }
        Ok(response)
    }
}
